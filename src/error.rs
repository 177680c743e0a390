//! ==============================================================================
//! error.rs - error taxonomy for the ingestion hub
//! ==============================================================================
//!
//! purpose:
//!     one typed error per failure domain. none of them cross domains:
//!     - ValidationError stays at the http boundary (answered with a 400)
//!     - SubscriberError stays inside a fan-out (logged, never propagated)
//!     - ServerError is returned from start()/stop() to the host
//!
//! ==============================================================================

use std::net::SocketAddr;
use thiserror::Error;

/// a payload that does not fit the reading schema.
///
/// only the first violated constraint is reported.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("body is not valid json: {0}")]
    MalformedJson(String),

    #[error("expected a json object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("missing required field `{field}`")]
    MissingField { field: String },

    #[error("field `{field}` must be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field `{field}` is outside the 64-bit integer range")]
    OutOfRange { field: String },

    #[error("`channels` must contain key \"{key}\"")]
    MissingChannel { key: &'static str },
}

/// a device id that is not exactly 12 lowercase hex characters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid device id {0:?}: expected 12 lowercase hex characters")]
pub struct InvalidDeviceId(pub String);

/// a discovery or update callback that failed during fan-out.
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("subscriber {id} failed: {source:#}")]
    Failed { id: u64, source: anyhow::Error },

    #[error("subscriber {id} panicked")]
    Panicked { id: u64 },
}

/// lifecycle failures of the ingestion endpoint.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ingestion endpoint already listening on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("ingestion endpoint terminated abnormally: {0}")]
    Serve(#[from] std::io::Error),

    #[error("ingestion endpoint task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
