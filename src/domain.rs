//! ==============================================================================
//! domain.rs - device readings and per-device state
//! ==============================================================================
//!
//! purpose:
//!     the value types that flow from the http route through the dispatcher
//!     to subscribers. readings are immutable once validated; DeviceState is
//!     the only thing that changes and it is owned by the dispatcher.
//!
//! relationships:
//!     - built by: validate.rs (DeviceReading, ParticulateReading)
//!     - built by: server.rs (DeviceId from the route, SensorData)
//!     - stored by: dispatcher.rs (DeviceState, Snapshot)
//!
//! ==============================================================================

use crate::error::InvalidDeviceId;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// a device that has not reported for this long is unavailable
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(5 * 60);

// ==============================================================================
// device id
// ==============================================================================

/// mac-derived device identifier: exactly 12 lowercase hex characters
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// prefix of the path segment devices post to (`airgradient:<id>`)
    pub const ROUTE_PREFIX: &'static str = "airgradient:";

    pub fn parse(s: &str) -> Result<Self, InvalidDeviceId> {
        let valid = s.len() == 12
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidDeviceId(s.to_owned()))
        }
    }

    /// extract the id from a `airgradient:<id>` path segment
    pub fn from_route_segment(segment: &str) -> Option<Self> {
        segment
            .strip_prefix(Self::ROUTE_PREFIX)
            .and_then(|id| Self::parse(id).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ==============================================================================
// readings
// ==============================================================================

/// particulate matter, temperature and humidity.
///
/// this is the per-channel shape of dual-sensor outdoor monitors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParticulateReading {
    pub pm01: i64,
    pub pm02: i64,
    pub pm10: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm003_count: Option<i64>,
    #[serde(rename = "atmp")]
    pub ambient_temp: f64,
    #[serde(rename = "rhum")]
    pub relative_humidity: f64,
}

/// one validated payload from a device.
///
/// the particulate block is shared with the per-channel shape; it is
/// flattened so the reading serializes back to the short keys the firmware posts.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceReading {
    #[serde(rename = "wifi")]
    pub wifi_rssi: i64,
    #[serde(rename = "boot")]
    pub boot_count: i64,
    #[serde(flatten)]
    pub particulate: ParticulateReading,
    #[serde(rename = "rco2", skip_serializing_if = "Option::is_none")]
    pub co2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvoc_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nox_index: Option<i64>,
    /// `[channel "1", channel "2"]`, dual-sensor models only
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_channels"
    )]
    pub channels: Option<[ParticulateReading; 2]>,
}

/// a single scalar value out of a reading
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Measurement {
    Integer(i64),
    Float(f64),
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:.1}", v),
        }
    }
}

impl DeviceReading {
    /// every scalar value the device actually reported, keyed by wire name.
    /// absent optional fields and the per-channel breakdown are skipped.
    pub fn measurements(&self) -> Vec<(&'static str, Measurement)> {
        use Measurement::{Float, Integer};

        let pm = &self.particulate;
        let optional = [
            ("pm003_count", pm.pm003_count),
            ("rco2", self.co2),
            ("tvoc_index", self.tvoc_index),
            ("nox_index", self.nox_index),
        ];

        let mut values = vec![
            ("wifi", Integer(self.wifi_rssi)),
            ("boot", Integer(self.boot_count)),
            ("pm01", Integer(pm.pm01)),
            ("pm02", Integer(pm.pm02)),
            ("pm10", Integer(pm.pm10)),
            ("atmp", Float(pm.ambient_temp)),
            ("rhum", Float(pm.relative_humidity)),
        ];
        values.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, Integer(v)))),
        );
        values
    }
}

fn serialize_channels<S: Serializer>(
    channels: &Option<[ParticulateReading; 2]>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match channels {
        Some([first, second]) => {
            let mut map = serializer.serialize_map(Some(2))?;
            map.serialize_entry("1", first)?;
            map.serialize_entry("2", second)?;
            map.end()
        }
        None => serializer.serialize_none(),
    }
}

// ==============================================================================
// ingestion event and device state
// ==============================================================================

/// one accepted push from a device
#[derive(Clone, Debug, PartialEq)]
pub struct SensorData {
    pub id: DeviceId,
    /// network origin of the request, when the transport knows it
    pub source_address: Option<String>,
    pub reading: DeviceReading,
}

/// what the dispatcher remembers about one device
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceState {
    pub latest_reading: Arc<DeviceReading>,
    pub last_seen_at: DateTime<Utc>,
    pub source_address: Option<String>,
}

impl DeviceState {
    /// availability is derived lazily: fresh while younger than the threshold
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        match (now - self.last_seen_at).to_std() {
            Ok(age) => age < STALENESS_THRESHOLD,
            // last seen after `now`
            Err(_) => true,
        }
    }
}

/// latest reading of every known device, as handed to update subscribers
pub type Snapshot = Arc<BTreeMap<DeviceId, Arc<DeviceReading>>>;
