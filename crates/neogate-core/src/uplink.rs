//! Cloud link interface.
//!
//! Every send returns a [`PublishHandle`]. QoS 0 handles are complete as soon as the
//! message is handed to the transport; QoS 1 handles resolve when the broker acknowledges.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::UplinkConfig;
use crate::data::{Attributes, TelemetryPoint};
use crate::error::Result;
use crate::rpc::DownlinkMessage;

/// Delivery-acknowledgment level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QoS {
    /// Fire-and-forget.
    AtMostOnce,
    /// Acknowledged.
    #[default]
    AtLeastOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Self {
        if level == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// Result code of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Success,
    NotConnected,
    Error(String),
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PublishResult::Success)
    }
}

/// Handle returned by every uplink send.
#[derive(Debug)]
pub struct PublishHandle {
    rc: PublishResult,
    ack: Option<oneshot::Receiver<PublishResult>>,
}

/// Sender half of a pending [`PublishHandle`], held by the transport.
#[derive(Debug)]
pub struct PublishAck {
    tx: oneshot::Sender<PublishResult>,
}

impl PublishAck {
    /// Resolve the paired handle. A dropped handle is ignored.
    pub fn resolve(self, result: PublishResult) {
        let _ = self.tx.send(result);
    }
}

impl PublishHandle {
    /// Handle that is already resolved.
    pub fn completed(rc: PublishResult) -> Self {
        Self { rc, ack: None }
    }

    /// Handle waiting for an acknowledgment.
    pub fn pending() -> (Self, PublishAck) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                rc: PublishResult::Success,
                ack: Some(rx),
            },
            PublishAck { tx },
        )
    }

    /// Result code known at send time.
    pub fn rc(&self) -> &PublishResult {
        &self.rc
    }

    pub fn is_pending(&self) -> bool {
        self.ack.is_some()
    }

    /// Wait for the acknowledgment, bounded by `timeout`.
    pub async fn wait(self, timeout: Duration) -> PublishResult {
        if !self.rc.is_success() {
            return self.rc;
        }
        match self.ack {
            None => self.rc,
            Some(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => PublishResult::Error("acknowledgment channel closed".into()),
                Err(_) => PublishResult::Error(format!(
                    "no acknowledgment within {}ms",
                    timeout.as_millis()
                )),
            },
        }
    }
}

/// Sender the uplink uses to hand inbound messages to the gateway.
pub type DownlinkSender = mpsc::UnboundedSender<DownlinkMessage>;

/// Cloud link used by the delivery engine and the RPC reply sender.
#[async_trait]
pub trait Uplink: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Start connecting. Returns once the connection attempt loop is running.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    async fn send_attributes(&self, device: &str, attributes: &Attributes, qos: QoS)
    -> PublishHandle;

    async fn send_telemetry(&self, device: &str, telemetry: &[TelemetryPoint], qos: QoS)
    -> PublishHandle;

    /// Reply to a command. `device` is `None` for gateway-level commands.
    async fn send_rpc_reply(
        &self,
        device: Option<&str>,
        request_id: u64,
        payload: &serde_json::Value,
        qos: QoS,
    ) -> PublishHandle;

    /// Announce a device to the cloud side.
    async fn send_device_connect(&self, device: &str, device_type: &str) -> PublishHandle;

    async fn send_device_disconnect(&self, device: &str) -> PublishHandle;
}

/// Builds uplinks from configuration; used at startup and for connection hot-swap.
pub trait UplinkFactory: Send + Sync {
    fn create(&self, config: &UplinkConfig, downlink: DownlinkSender) -> Result<Arc<dyn Uplink>>;
}
