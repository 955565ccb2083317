//! Common data shape produced by connectors.
//!
//! Every connector converts its wire protocol into [`ConvertedData`]: one device,
//! a set of attributes and an ordered list of telemetry entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute mapping (key → value).
pub type Attributes = Map<String, Value>;

/// Telemetry values of a single timestamp.
pub type TelemetryValues = Map<String, Value>;

/// Default device type used when a connector does not provide one.
pub const DEFAULT_DEVICE_TYPE: &str = "default";

fn default_device_type() -> String {
    DEFAULT_DEVICE_TYPE.to_string()
}

/// Current wall clock in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One telemetry entry as emitted by a connector.
///
/// `ts` is kept as raw JSON: connectors built on converters may emit strings or floats,
/// which ingestion corrects to the ingestion-time clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TelemetryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Value>,
    #[serde(default)]
    pub values: TelemetryValues,
}

impl TelemetryEntry {
    /// Entry without a timestamp.
    pub fn new(values: TelemetryValues) -> Self {
        Self { ts: None, values }
    }

    /// Entry stamped with `ts` milliseconds.
    pub fn with_ts(ts: i64, values: TelemetryValues) -> Self {
        Self {
            ts: Some(Value::from(ts)),
            values,
        }
    }

    /// Integer timestamp in milliseconds, if the entry carries one.
    pub fn millis(&self) -> Option<i64> {
        self.ts.as_ref().and_then(Value::as_i64)
    }

    /// Whether a timestamp is present but not an integer.
    pub fn has_invalid_ts(&self) -> bool {
        matches!(&self.ts, Some(ts) if ts.as_i64().is_none())
    }
}

/// Normalized telemetry point handed to the uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub ts: i64,
    pub values: TelemetryValues,
}

impl TelemetryPoint {
    pub fn new(ts: i64, values: TelemetryValues) -> Self {
        Self { ts, values }
    }
}

/// One connector's output for one device at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedData {
    pub device_name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub telemetry: Vec<TelemetryEntry>,
}

impl ConvertedData {
    /// Create an empty record for `device_name` with the default device type.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            device_type: default_device_type(),
            attributes: Attributes::new(),
            telemetry: Vec::new(),
        }
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_telemetry(mut self, entry: TelemetryEntry) -> Self {
        self.telemetry.push(entry);
        self
    }

    /// Append an entry holding a single key without a timestamp.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = TelemetryValues::new();
        values.insert(key.into(), value.into());
        self.telemetry.push(TelemetryEntry::new(values));
        self
    }

    /// True when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.telemetry.iter().all(|e| e.values.is_empty())
    }

    /// Number of attribute and telemetry keys carried by the record.
    pub fn key_count(&self) -> usize {
        self.attributes.len() + self.telemetry.iter().map(|e| e.values.len()).sum::<usize>()
    }

    /// Size of the compact JSON encoding in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// Result of handing a record to the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Record (or all its splits) stored.
    Success,
    /// Nothing changed since the last send; nothing was stored.
    NoNewData,
    /// Device denied by policy.
    ForbiddenDevice,
    /// Record malformed.
    InvalidData,
    /// Record could not be stored.
    Failure,
}

impl IngestStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IngestStatus::Success)
    }
}

/// Record appended to the event storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub connector_name: String,
    pub connector_id: String,
    pub data: ConvertedData,
    pub enqueued_at: i64,
}

impl QueuedEvent {
    pub fn new(
        connector_name: impl Into<String>,
        connector_id: impl Into<String>,
        data: ConvertedData,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            connector_id: connector_id.into(),
            data,
            enqueued_at: now_millis(),
        }
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_defaults() {
        let data: ConvertedData =
            serde_json::from_value(json!({"deviceName": "d1", "telemetry": [{"values": {"t": 21}}]}))
                .unwrap();
        assert_eq!(data.device_type, "default");
        assert!(data.attributes.is_empty());
        assert_eq!(data.telemetry.len(), 1);
        assert_eq!(data.telemetry[0].ts, None);
        assert!(!data.is_empty());
    }

    #[test]
    fn test_empty_record() {
        let data = ConvertedData::new("d1").with_telemetry(TelemetryEntry::default());
        assert!(data.is_empty());
        assert_eq!(data.key_count(), 0);
    }

    #[test]
    fn test_ts_helpers() {
        let entry = TelemetryEntry::with_ts(1_700_000_000_000, TelemetryValues::new());
        assert_eq!(entry.millis(), Some(1_700_000_000_000));
        assert!(!entry.has_invalid_ts());

        let bad = TelemetryEntry {
            ts: Some(json!("yesterday")),
            values: TelemetryValues::new(),
        };
        assert_eq!(bad.millis(), None);
        assert!(bad.has_invalid_ts());
    }

    #[test]
    fn test_queued_event_bytes() {
        let event = QueuedEvent::new("modbus", "id-1", ConvertedData::new("d1").with_value("t", 1));
        let bytes = event.to_bytes().unwrap();
        let back = QueuedEvent::from_bytes(&bytes).unwrap();
        assert_eq!(back, event);
        assert!(QueuedEvent::from_bytes(b"not json").is_err());
    }
}
