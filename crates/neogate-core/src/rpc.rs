//! Downlink content types: commands and attribute updates routed back to devices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConnectorConfig, StorageConfig, UplinkConfig};
use crate::data::Attributes;

/// Command payload: `{id, method, params?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcData {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Server-issued command: `{device, data: {id, method, params?}}`.
///
/// `device` is empty for commands not bound to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub device: String,
    pub data: RpcData,
}

impl RpcRequest {
    pub fn new(device: impl Into<String>, id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            device: device.into(),
            data: RpcData {
                id,
                method: method.into(),
                params,
            },
        }
    }

    pub fn is_device_bound(&self) -> bool {
        !self.device.is_empty()
    }

    /// Split `"<module>_<method>"` into its parts.
    pub fn module_method(&self) -> Option<(&str, &str)> {
        self.data
            .method
            .split_once('_')
            .filter(|(module, method)| !module.is_empty() && !method.is_empty())
    }

    /// Per-request timeout requested by the caller, in milliseconds.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.data.params.get("timeout").and_then(Value::as_u64)
    }
}

/// Shared attribute update: `{device, data: {key: value, ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub device: String,
    pub data: Attributes,
}

/// Reply to a command, sent back over the uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    /// Target device; `None` for gateway-level commands.
    pub device: Option<String>,
    /// Cloud-side request id.
    pub request_id: u64,
    pub payload: Value,
}

impl RpcReply {
    pub fn success(device: Option<String>, request_id: u64, payload: Value) -> Self {
        Self {
            device,
            request_id,
            payload,
        }
    }

    pub fn failure(device: Option<String>, request_id: u64, error: impl Into<String>) -> Self {
        Self {
            device,
            request_id,
            payload: serde_json::json!({ "success": false, "error": error.into() }),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.payload.get("success").and_then(Value::as_bool) == Some(false)
    }
}

/// Everything the uplink can deliver to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkMessage {
    /// Command addressed to a device, or unbound `"<module>_<method>"` command.
    Rpc(RpcRequest),
    /// Command addressed to the gateway itself.
    GatewayRpc { request_id: u64, method: String, params: Value },
    /// Shared attribute update for a device.
    AttributeUpdate(AttributeUpdate),
    /// New configuration pushed from the cloud side.
    Configuration(ConfigurationUpdate),
}

/// Remote configuration payload, one category at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationUpdate {
    Connection(UplinkConfig),
    Storage(StorageConfig),
    Connectors(Vec<ConnectorConfig>),
}

impl ConfigurationUpdate {
    pub fn category(&self) -> &'static str {
        match self {
            ConfigurationUpdate::Connection(_) => "connection",
            ConfigurationUpdate::Storage(_) => "storage",
            ConfigurationUpdate::Connectors(_) => "connectors",
        }
    }

    /// Parse one shared attribute of the gateway device into a configuration update.
    pub fn from_attribute(key: &str, value: &Value) -> Option<crate::Result<Self>> {
        let parsed = match key {
            "connection_configuration" => serde_json::from_value(value.clone())
                .map(ConfigurationUpdate::Connection),
            "storage_configuration" => {
                serde_json::from_value(value.clone()).map(ConfigurationUpdate::Storage)
            }
            "connectors_configuration" => serde_json::from_value(value.clone())
                .map(ConfigurationUpdate::Connectors),
            _ => return None,
        };
        Some(parsed.map_err(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parse() {
        let request: RpcRequest = serde_json::from_value(json!({
            "device": "d1",
            "data": {"id": 5, "method": "setValve", "params": {"open": true, "timeout": 1500}}
        }))
        .unwrap();
        assert!(request.is_device_bound());
        assert_eq!(request.data.id, 5);
        assert_eq!(request.timeout_ms(), Some(1500));
    }

    #[test]
    fn test_module_method() {
        let request = RpcRequest::new("", 1, "modbus_read", Value::Null);
        assert_eq!(request.module_method(), Some(("modbus", "read")));
        assert_eq!(
            RpcRequest::new("", 1, "gateway_device_renamed", Value::Null).module_method(),
            Some(("gateway", "device_renamed"))
        );
        assert_eq!(RpcRequest::new("", 1, "ping", Value::Null).module_method(), None);
        assert_eq!(RpcRequest::new("", 1, "_x", Value::Null).module_method(), None);
    }

    #[test]
    fn test_failure_reply() {
        let reply = RpcReply::failure(Some("d1".into()), 3, "timeout");
        assert!(reply.is_failure());
        assert!(!RpcReply::success(None, 3, json!({"ok": 1})).is_failure());
    }

    #[test]
    fn test_configuration_from_attribute() {
        let update = ConfigurationUpdate::from_attribute(
            "storage_configuration",
            &json!({"type": "memory", "max_records_count": 10}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(update.category(), "storage");
        assert!(ConfigurationUpdate::from_attribute("firmware", &json!(1)).is_none());
        assert!(
            ConfigurationUpdate::from_attribute("storage_configuration", &json!({"type": "tape"}))
                .unwrap()
                .is_err()
        );
    }
}
