//! Gateway topic family and payload codec.
//!
//! Transport-independent: the MQTT client in [`mqtt`] only moves bytes between the
//! broker and these functions.

#[cfg(feature = "mqtt")]
pub mod mqtt;

use neogate_core::{
    AttributeUpdate, Attributes, ConfigurationUpdate, DownlinkMessage, Error, Result, RpcRequest,
    TelemetryPoint,
};
use serde_json::{Value, json};
use tracing::warn;

pub const TELEMETRY_TOPIC: &str = "v1/gateway/telemetry";
pub const ATTRIBUTES_TOPIC: &str = "v1/gateway/attributes";
pub const CONNECT_TOPIC: &str = "v1/gateway/connect";
pub const DISCONNECT_TOPIC: &str = "v1/gateway/disconnect";
pub const RPC_TOPIC: &str = "v1/gateway/rpc";
pub const GATEWAY_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
pub const GATEWAY_RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";
pub const GATEWAY_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";
pub const GATEWAY_ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";

/// Topics the gateway subscribes to after every connect.
pub const SUBSCRIPTIONS: [&str; 4] = [
    ATTRIBUTES_TOPIC,
    RPC_TOPIC,
    GATEWAY_RPC_REQUEST_FILTER,
    GATEWAY_ATTRIBUTES_TOPIC,
];

pub fn telemetry_payload(device: &str, points: &[TelemetryPoint]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({ device: points }))?)
}

pub fn attributes_payload(device: &str, attributes: &Attributes) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({ device: attributes }))?)
}

pub fn connect_payload(device: &str, device_type: &str) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({ "device": device, "type": device_type }))?)
}

pub fn disconnect_payload(device: &str) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({ "device": device }))?)
}

/// Topic and payload of a command reply. Device replies share the gateway RPC topic;
/// gateway-level replies go to the per-request response topic.
pub fn rpc_reply(device: Option<&str>, request_id: u64, payload: &Value) -> Result<(String, Vec<u8>)> {
    match device {
        Some(device) => Ok((
            RPC_TOPIC.to_string(),
            serde_json::to_vec(&json!({ "device": device, "id": request_id, "data": payload }))?,
        )),
        None => Ok((
            format!("{}{}", GATEWAY_RPC_RESPONSE_PREFIX, request_id),
            serde_json::to_vec(payload)?,
        )),
    }
}

fn configuration_updates(attributes: &serde_json::Map<String, Value>) -> Vec<DownlinkMessage> {
    attributes
        .iter()
        .filter_map(|(key, value)| match ConfigurationUpdate::from_attribute(key, value)? {
            Ok(update) => Some(DownlinkMessage::Configuration(update)),
            Err(e) => {
                warn!(attribute = %key, error = %e, "Ignoring malformed remote configuration");
                None
            }
        })
        .collect()
}

/// Decode one inbound message. Unknown topics yield nothing.
pub fn parse_downlink(topic: &str, payload: &[u8]) -> Result<Vec<DownlinkMessage>> {
    match topic {
        RPC_TOPIC => {
            let request: RpcRequest = serde_json::from_slice(payload)?;
            Ok(vec![DownlinkMessage::Rpc(request)])
        }
        ATTRIBUTES_TOPIC => {
            let update: AttributeUpdate = serde_json::from_slice(payload)?;
            Ok(vec![DownlinkMessage::AttributeUpdate(update)])
        }
        GATEWAY_ATTRIBUTES_TOPIC => {
            let value: Value = serde_json::from_slice(payload)?;
            let attributes = value
                .get("shared")
                .unwrap_or(&value)
                .as_object()
                .ok_or_else(|| Error::Validation("attribute payload is not an object".into()))?;
            Ok(configuration_updates(attributes))
        }
        _ => {
            let Some(id) = topic.strip_prefix(GATEWAY_RPC_REQUEST_PREFIX) else {
                return Ok(Vec::new());
            };
            let request_id: u64 = id
                .parse()
                .map_err(|_| Error::Validation(format!("bad request id in topic '{}'", topic)))?;
            let value: Value = serde_json::from_slice(payload)?;
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("gateway RPC without method".into()))?
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            Ok(vec![DownlinkMessage::GatewayRpc {
                request_id,
                method,
                params,
            }])
        }
    }
}
