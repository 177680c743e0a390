//! ==============================================================================
//! validate.rs - reading schema and validator
//! ==============================================================================
//!
//! purpose:
//!     turns an untrusted json body into a DeviceReading, or reports the first
//!     constraint it breaks. pure: no state, no logging, no side effects.
//!
//! rules:
//!     - integer fields take json integers only (1.0 and 1.5 are both rejected);
//!       integers past the i64 range are reported as out of range
//!     - atmp / rhum take any json number
//!     - optional fields treat an explicit null as absent
//!     - unknown fields are ignored (newer firmware adds keys)
//!     - `channels` is {"1": pm, "2": pm} and comes out as [pm1, pm2]
//!
//! fields are checked in a fixed order so the reported error is stable:
//!     wifi, boot, pm01, pm02, pm10, pm003_count, atmp, rhum,
//!     rco2, tvoc_index, nox_index, channels
//!
//! relationships:
//!     - used by: server.rs (request body -> DeviceReading)
//!     - produces: domain.rs types
//!
//! ==============================================================================

use crate::domain::{DeviceReading, ParticulateReading};
use crate::error::ValidationError;

use serde_json::{Map, Value};

/// keys of the dual-channel map, in output order
const CHANNEL_KEYS: [&str; 2] = ["1", "2"];

/// parse and validate a raw request body
pub fn parse_body(body: &[u8]) -> Result<DeviceReading, ValidationError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
    validate_reading(&value)
}

/// validate an already-parsed json value
pub fn validate_reading(value: &Value) -> Result<DeviceReading, ValidationError> {
    let fields = match value.as_object() {
        Some(map) => Fields::new(map, None),
        None => {
            return Err(ValidationError::NotAnObject {
                found: kind_of(value),
            })
        }
    };

    Ok(DeviceReading {
        wifi_rssi: fields.required_int("wifi")?,
        boot_count: fields.required_int("boot")?,
        particulate: particulate(&fields)?,
        co2: fields.optional_int("rco2")?,
        tvoc_index: fields.optional_int("tvoc_index")?,
        nox_index: fields.optional_int("nox_index")?,
        channels: channels(&fields)?,
    })
}

fn particulate(fields: &Fields<'_>) -> Result<ParticulateReading, ValidationError> {
    Ok(ParticulateReading {
        pm01: fields.required_int("pm01")?,
        pm02: fields.required_int("pm02")?,
        pm10: fields.required_int("pm10")?,
        pm003_count: fields.optional_int("pm003_count")?,
        ambient_temp: fields.required_number("atmp")?,
        relative_humidity: fields.required_number("rhum")?,
    })
}

fn channels(fields: &Fields<'_>) -> Result<Option<[ParticulateReading; 2]>, ValidationError> {
    let Some(value) = fields.optional("channels") else {
        return Ok(None);
    };
    let map = value
        .as_object()
        .ok_or_else(|| fields.wrong_type("channels", "an object", value))?;

    let [first, second] = CHANNEL_KEYS;
    Ok(Some([channel(map, first)?, channel(map, second)?]))
}

fn channel(
    channels: &Map<String, Value>,
    key: &'static str,
) -> Result<ParticulateReading, ValidationError> {
    let value = channels
        .get(key)
        .ok_or(ValidationError::MissingChannel { key })?;
    let scope = format!("channels.{key}");
    let map = value.as_object().ok_or_else(|| ValidationError::WrongType {
        field: scope.clone(),
        expected: "an object",
        found: kind_of(value),
    })?;

    particulate(&Fields::new(map, Some(scope)))
}

// ==============================================================================
// field access
// ==============================================================================

/// typed lookups over one json object; `scope` prefixes reported field names
struct Fields<'a> {
    map: &'a Map<String, Value>,
    scope: Option<String>,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>, scope: Option<String>) -> Self {
        Self { map, scope }
    }

    fn name(&self, key: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}.{key}"),
            None => key.to_owned(),
        }
    }

    fn wrong_type(&self, key: &str, expected: &'static str, value: &Value) -> ValidationError {
        ValidationError::WrongType {
            field: self.name(key),
            expected,
            found: kind_of(value),
        }
    }

    fn required(&self, key: &str) -> Result<&'a Value, ValidationError> {
        self.map.get(key).ok_or_else(|| ValidationError::MissingField {
            field: self.name(key),
        })
    }

    fn optional(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn int(&self, key: &str, value: &Value) -> Result<i64, ValidationError> {
        match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                n.as_i64().ok_or_else(|| ValidationError::OutOfRange {
                    field: self.name(key),
                })
            }
            _ => Err(self.wrong_type(key, "an integer", value)),
        }
    }

    fn required_int(&self, key: &str) -> Result<i64, ValidationError> {
        self.int(key, self.required(key)?)
    }

    fn optional_int(&self, key: &str) -> Result<Option<i64>, ValidationError> {
        self.optional(key)
            .map(|value| self.int(key, value))
            .transpose()
    }

    fn required_number(&self, key: &str) -> Result<f64, ValidationError> {
        let value = self.required(key)?;
        value
            .as_f64()
            .ok_or_else(|| self.wrong_type(key, "a number", value))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a float",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
