//! AirGradient push-ingestion hub.
//!
//! Devices POST readings to `/sensors/airgradient:<id>/measures`; each body is
//! validated, recorded as the device's latest state and fanned out to
//! discovery and update subscribers.

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod server;
pub mod subscribers;
pub mod validate;

pub use dispatcher::Dispatcher;
pub use domain::{
    DeviceId, DeviceReading, DeviceState, Measurement, ParticulateReading, SensorData, Snapshot,
    STALENESS_THRESHOLD,
};
pub use error::{InvalidDeviceId, ServerError, SubscriberError, ValidationError};
pub use server::IngestServer;
pub use subscribers::{SubscriberId, Subscribers};
