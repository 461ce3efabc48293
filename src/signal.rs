//! Signal, sample and status types shared by every layer.

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

pub const MAX_SIGNAL_KEY_LEN: usize = 64;

/// Stable identity of a signal, e.g. `Device3_Voltage`.
pub type SignalKey = ArrayString<MAX_SIGNAL_KEY_LEN>;

/// Builds a signal key, `None` when the text does not fit.
pub fn signal_key(text: &str) -> Option<SignalKey> {
    ArrayString::from(text).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Double,
    Boolean,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Double => "Double",
            ValueType::Boolean => "Boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Double(f64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Double(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Boolean(_) => None,
        }
    }

    /// Dashboard rendering: `ON`/`OFF` for booleans, one decimal for doubles.
    pub fn display(&self) -> String {
        match self {
            Value::Boolean(true) => "ON".to_string(),
            Value::Boolean(false) => "OFF".to_string(),
            Value::Double(v) => format!("{:.1}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Good,
    BadNoData,
    BadInternalError,
    BadNodeIdUnknown,
    BadNotWritable,
    BadTypeMismatch,
    BadDecodingError,
    BadSubscriptionIdInvalid,
}

impl StatusCode {
    pub fn is_good(&self) -> bool {
        matches!(self, StatusCode::Good)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Good => "Good",
            StatusCode::BadNoData => "BadNoData",
            StatusCode::BadInternalError => "BadInternalError",
            StatusCode::BadNodeIdUnknown => "BadNodeIdUnknown",
            StatusCode::BadNotWritable => "BadNotWritable",
            StatusCode::BadTypeMismatch => "BadTypeMismatch",
            StatusCode::BadDecodingError => "BadDecodingError",
            StatusCode::BadSubscriptionIdInvalid => "BadSubscriptionIdInvalid",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StatusCode::Good => "The operation succeeded",
            StatusCode::BadNoData => "No data exists for the requested signal or time range",
            StatusCode::BadInternalError => "An internal error occurred in the store or simulation",
            StatusCode::BadNodeIdUnknown => "The signal key is not registered",
            StatusCode::BadNotWritable => "The signal is read-only",
            StatusCode::BadTypeMismatch => "The value type does not match the signal's declared type",
            StatusCode::BadDecodingError => "The request could not be decoded",
            StatusCode::BadSubscriptionIdInvalid => "The subscription id is not valid for this session",
        }
    }
}

impl core::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// The four physical quantities every device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    Temperature,
    Power,
    Voltage,
    Current,
}

impl Quantity {
    pub const ALL: [Quantity; 4] = [
        Quantity::Temperature,
        Quantity::Power,
        Quantity::Voltage,
        Quantity::Current,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Temperature => "Temperature",
            Quantity::Power => "Power",
            Quantity::Voltage => "Voltage",
            Quantity::Current => "Current",
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Quantity::Power => ValueType::Boolean,
            _ => ValueType::Double,
        }
    }

    /// Only the power switch accepts writes.
    pub fn writable(&self) -> bool {
        matches!(self, Quantity::Power)
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Power => "",
            Quantity::Voltage => "V",
            Quantity::Current => "A",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Quantity::Temperature => "Temperature (°C)",
            Quantity::Power => "Power state",
            Quantity::Voltage => "Voltage (V)",
            Quantity::Current => "Current (A)",
        }
    }

    /// `Device1` + `Temperature` -> `Device1_Temperature`.
    pub fn key_for(&self, device: &str) -> Option<SignalKey> {
        let mut key = SignalKey::new();
        key.try_push_str(device).ok()?;
        key.try_push('_').ok()?;
        key.try_push_str(self.as_str()).ok()?;
        Some(key)
    }
}

/// Immutable signal metadata, fixed at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub key: SignalKey,
    pub device: String,
    pub quantity: Quantity,
    pub value_type: ValueType,
    pub writable: bool,
    pub min_sampling_interval_ms: u64,
    pub retention: usize,
}

impl SignalSpec {
    pub fn for_quantity(
        device: &str,
        quantity: Quantity,
        min_sampling_interval_ms: u64,
        retention: usize,
    ) -> Option<Self> {
        Some(Self {
            key: quantity.key_for(device)?,
            device: device.to_string(),
            quantity,
            value_type: quantity.value_type(),
            writable: quantity.writable(),
            min_sampling_interval_ms,
            retention,
        })
    }
}

/// One stored observation. `value` is `None` only for no-data placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: Option<Value>,
    pub status: StatusCode,
    pub source_timestamp: u64,
    pub server_timestamp: u64,
}

impl Sample {
    pub fn good(value: Value, source_timestamp: u64, server_timestamp: u64) -> Self {
        Self {
            value: Some(value),
            status: StatusCode::Good,
            source_timestamp,
            server_timestamp,
        }
    }

    pub fn no_data(status: StatusCode) -> Self {
        Self {
            value: None,
            status,
            source_timestamp: 0,
            server_timestamp: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_composition() {
        let key = Quantity::Voltage.key_for("Device3").unwrap();
        assert_eq!(key.as_str(), "Device3_Voltage");
    }

    #[test]
    fn test_key_too_long() {
        let name = "D".repeat(MAX_SIGNAL_KEY_LEN);
        assert!(Quantity::Power.key_for(&name).is_none());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Boolean(true).display(), "ON");
        assert_eq!(Value::Boolean(false).display(), "OFF");
        assert_eq!(Value::Double(219.96).display(), "220.0");
    }

    #[test]
    fn test_value_json_shape() {
        assert_eq!(serde_json::to_string(&Value::Boolean(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&Value::Double(2.5)).unwrap(), "2.5");
        let parsed: Value = serde_json::from_str("25.0").unwrap();
        assert_eq!(parsed, Value::Double(25.0));
    }
}
