//! Request surface shared by the TCP server, the dashboard view and the
//! pub/sub bridge. Every call returns synchronously with an explicit status;
//! only subscription delivery is asynchronous (`SubscriptionHandle::next`).

use crate::device::{DeviceBank, DeviceCommand};
use crate::hub::{HubError, SubscriptionHandle, SubscriptionHub, SubscriptionId, SubscriptionParams};
use crate::signal::{Quantity, Sample, SignalKey, SignalSpec, StatusCode, Value, ValueType};
use crate::store::{HistoryResult, TimeSeriesStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub status: StatusCode,
    pub message: String,
}

impl WriteOutcome {
    fn accepted(message: String) -> Self {
        Self {
            success: true,
            status: StatusCode::Good,
            message,
        }
    }

    fn rejected(signal: &str, status: StatusCode) -> Self {
        Self {
            success: false,
            status,
            message: format!("Write to {} failed: {}", signal, status_message(status)),
        }
    }
}

/// `"BadNotWritable: The signal is read-only"`.
pub fn status_message(status: StatusCode) -> String {
    format!("{}: {}", status.name(), status.description())
}

/// Browse entry for one registered signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub signal: SignalKey,
    pub device: String,
    pub name: String,
    pub display_name: String,
    pub unit: String,
    pub data_type: ValueType,
    pub writable: bool,
    pub min_sampling_interval_ms: u64,
    pub retention: usize,
}

impl From<&SignalSpec> for SignalInfo {
    fn from(spec: &SignalSpec) -> Self {
        Self {
            signal: spec.key,
            device: spec.device.clone(),
            name: spec.quantity.as_str().to_string(),
            display_name: spec.quantity.display_name().to_string(),
            unit: spec.quantity.unit().to_string(),
            data_type: spec.value_type,
            writable: spec.writable,
            min_sampling_interval_ms: spec.min_sampling_interval_ms,
            retention: spec.retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableView {
    pub info: SignalInfo,
    pub value: Option<Value>,
    pub display_value: String,
    pub quality: StatusCode,
    pub source_timestamp: u64,
    pub server_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub name: String,
    pub display_name: String,
    pub variables: Vec<VariableView>,
}

#[derive(Clone)]
pub struct AccessGateway {
    store: Arc<TimeSeriesStore>,
    devices: Arc<DeviceBank>,
    hub: Arc<SubscriptionHub>,
}

impl AccessGateway {
    pub fn new(store: Arc<TimeSeriesStore>, devices: Arc<DeviceBank>, hub: Arc<SubscriptionHub>) -> Self {
        Self { store, devices, hub }
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }

    /// Latest sample; `BadNodeIdUnknown` placeholder for unregistered keys.
    pub fn read(&self, signal: &str) -> Sample {
        if !self.store.contains(signal) {
            return Sample::no_data(StatusCode::BadNodeIdUnknown);
        }
        self.store.read_latest(signal)
    }

    pub fn write(&self, signal: &str, value: Value) -> WriteOutcome {
        let Some(spec) = self.store.spec(signal) else {
            return WriteOutcome::rejected(signal, StatusCode::BadNodeIdUnknown);
        };
        if !spec.writable {
            warn!("Rejected write to read-only signal {}", signal);
            return WriteOutcome::rejected(signal, StatusCode::BadNotWritable);
        }
        if value.value_type() != spec.value_type {
            warn!(
                "Rejected {} write to {} signal {}",
                value.value_type().as_str(),
                spec.value_type.as_str(),
                signal
            );
            return WriteOutcome::rejected(signal, StatusCode::BadTypeMismatch);
        }
        let timestamp = match self.store.clock().now_ms() {
            Ok(now) => now,
            Err(e) => {
                warn!("Clock failure while writing {}: {}", signal, e);
                return WriteOutcome::rejected(signal, StatusCode::BadInternalError);
            }
        };

        // Hold the owning device while storing and publishing so the live state,
        // the timeline and every subscriber queue see one write order.
        let located = self.devices.locate(signal);
        let mut device = located.and_then(|(slot, _)| self.devices.lock(slot));
        if let (Some(device), Some((_, Quantity::Power)), Some(on)) = (device.as_mut(), located, value.as_bool()) {
            device.execute_command(DeviceCommand::SetPower(on));
        }
        let Some(sample) = self.store.write(signal, value, timestamp) else {
            return WriteOutcome::rejected(signal, StatusCode::BadInternalError);
        };
        self.hub.publish(signal, sample);
        drop(device);

        info!("{} set to {}", signal, value.display());

        let message = match (located, spec.device.as_str()) {
            (Some((_, Quantity::Power)), device) => {
                format!("{} power state changed to {}", device, value.display())
            }
            _ => format!("{} set to {}", signal, value.display()),
        };
        WriteOutcome::accepted(message)
    }

    /// Loosely typed write used by the dashboard: booleans accept
    /// `true`/`false`/`"ON"`/`"OFF"`, doubles accept numbers or numeric text.
    pub fn write_json(&self, signal: &str, raw: &serde_json::Value) -> WriteOutcome {
        let Some(spec) = self.store.spec(signal) else {
            return WriteOutcome::rejected(signal, StatusCode::BadNodeIdUnknown);
        };
        match coerce(spec.value_type, raw) {
            Some(value) => self.write(signal, value),
            None => WriteOutcome::rejected(signal, StatusCode::BadTypeMismatch),
        }
    }

    /// Never fails: unknown keys answer `BadNodeIdUnknown`, misses `BadNoData`.
    pub fn query_history(&self, signal: &str, start: Option<u64>, end: Option<u64>, max_count: usize) -> HistoryResult {
        if !self.store.contains(signal) {
            return HistoryResult::empty(StatusCode::BadNodeIdUnknown);
        }
        self.store.read_range(signal, start, end, max_count)
    }

    /// History of every registered signal over the same window. Signals
    /// without matching samples map to an empty list.
    pub fn query_all_history(
        &self,
        start: Option<u64>,
        end: Option<u64>,
        max_count: usize,
    ) -> BTreeMap<SignalKey, Vec<Sample>> {
        self.store
            .specs()
            .map(|spec| (spec.key, self.store.read_range(&spec.key, start, end, max_count).samples))
            .collect()
    }

    /// Current sample of every signal. Pure read.
    pub fn publish_snapshot(&self) -> BTreeMap<SignalKey, Sample> {
        self.store
            .specs()
            .map(|spec| (spec.key, self.store.read_latest(&spec.key)))
            .collect()
    }

    pub fn browse(&self) -> Vec<SignalInfo> {
        self.store.specs().map(SignalInfo::from).collect()
    }

    pub fn device_snapshot(&self) -> Vec<DeviceView> {
        let mut views = Vec::with_capacity(self.devices.len());
        for slot in 0..self.devices.len() {
            let Some((name, display_name, keys)) = self.devices.lock(slot).map(|device| {
                let keys: Vec<SignalKey> = Quantity::ALL.iter().map(|q| device.key(*q)).collect();
                (device.name().to_string(), device.profile().display_name.clone(), keys)
            }) else {
                continue;
            };

            let variables = keys
                .iter()
                .filter_map(|key| {
                    let spec = self.store.spec(key)?;
                    let sample = self.store.read_latest(key);
                    Some(VariableView {
                        info: SignalInfo::from(spec),
                        value: sample.value,
                        display_value: sample.value.map(|v| v.display()).unwrap_or_else(|| "N/A".to_string()),
                        quality: sample.status,
                        source_timestamp: sample.source_timestamp,
                        server_timestamp: sample.server_timestamp,
                    })
                })
                .collect();

            views.push(DeviceView {
                name,
                display_name,
                variables,
            });
        }
        views
    }

    pub fn reset_history(&self) {
        self.store.clear();
        info!("History cleared for all signals");
    }

    pub fn subscribe(&self, signal: &str, params: SubscriptionParams) -> Result<SubscriptionHandle, HubError> {
        self.hub.subscribe(signal, params)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }
}

fn coerce(value_type: ValueType, raw: &serde_json::Value) -> Option<Value> {
    match (value_type, raw) {
        (ValueType::Boolean, serde_json::Value::Bool(b)) => Some(Value::Boolean(*b)),
        (ValueType::Boolean, serde_json::Value::String(text)) => match text.to_ascii_lowercase().as_str() {
            "on" | "true" => Some(Value::Boolean(true)),
            "off" | "false" => Some(Value::Boolean(false)),
            _ => None,
        },
        (ValueType::Double, serde_json::Value::Number(n)) => n.as_f64().map(Value::Double),
        (ValueType::Double, serde_json::Value::String(text)) => text.trim().parse().ok().map(Value::Double),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_boolean_forms() {
        assert_eq!(coerce(ValueType::Boolean, &json!("ON")), Some(Value::Boolean(true)));
        assert_eq!(coerce(ValueType::Boolean, &json!("off")), Some(Value::Boolean(false)));
        assert_eq!(coerce(ValueType::Boolean, &json!(false)), Some(Value::Boolean(false)));
        assert_eq!(coerce(ValueType::Boolean, &json!(1)), None);
    }

    #[test]
    fn test_coerce_double_forms() {
        assert_eq!(coerce(ValueType::Double, &json!(2.5)), Some(Value::Double(2.5)));
        assert_eq!(coerce(ValueType::Double, &json!(" 220.1 ")), Some(Value::Double(220.1)));
        assert_eq!(coerce(ValueType::Double, &json!(true)), None);
    }

    #[test]
    fn test_status_message() {
        assert_eq!(
            status_message(StatusCode::BadNotWritable),
            "BadNotWritable: The signal is read-only"
        );
    }
}
