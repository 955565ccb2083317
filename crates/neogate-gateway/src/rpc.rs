//! RPC correlation and routing.
//!
//! [`RpcCorrelation`] owns the in-flight table. Every entry ends exactly once: replied,
//! cancelled or timed out. Removal and the timeout callback happen under the table lock,
//! so a late reply can never fire a second time.
//!
//! [`RpcRouter`] turns inbound commands into connector calls or built-in gateway methods.
//! Replies and device notifications leave through one outbound channel drained by
//! [`run_reply_sender`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use neogate_core::{Error, QoS, RpcReply, RpcRequest, Uplink};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::DeviceDirectory;
use crate::manager::ConnectorManager;
use crate::stats::{GatewayStats, bump};
use crate::{SharedStorage, SharedUplink};

/// Invoked with the gateway request id when a request times out.
pub type CancelCallback = Box<dyn FnOnce(u64) + Send>;

/// Everything sent to the cloud outside the delivery engine.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Reply(RpcReply),
    DeviceConnected { device: String, device_type: String },
    DeviceDisconnected { device: String },
}

struct InFlight {
    /// Device name as the connector knows it; empty for unbound requests.
    local_device: String,
    /// Device name the reply is addressed to; `None` for gateway-level requests.
    reply_device: Option<String>,
    cloud_id: u64,
    deadline: Instant,
    on_timeout: Option<CancelCallback>,
}

#[derive(Default)]
struct RpcTable {
    by_id: HashMap<u64, InFlight>,
    by_cloud: HashMap<(String, u64), u64>,
}

impl RpcTable {
    fn remove(&mut self, request_id: u64) -> Option<InFlight> {
        let entry = self.by_id.remove(&request_id)?;
        self.by_cloud.remove(&(entry.local_device.clone(), entry.cloud_id));
        Some(entry)
    }
}

pub struct RpcCorrelation {
    next_id: AtomicU64,
    table: Mutex<RpcTable>,
    default_timeout: Duration,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    stats: Arc<GatewayStats>,
}

impl RpcCorrelation {
    pub fn new(
        default_timeout: Duration,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(RpcTable::default()),
            default_timeout,
            outbound,
            stats,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Queue a message for the reply sender.
    pub fn send_outbound(&self, message: OutboundMessage) {
        if self.outbound.send(message).is_err() {
            warn!("Reply sender is gone, dropping outbound message");
        }
    }

    /// Track a request forwarded to a connector. Returns the gateway request id.
    ///
    /// `local_device` is empty for requests not bound to a device. A request already in
    /// flight under the same `(local_device, cloud_id)` is superseded: it ends with a
    /// failure reply and its timeout callback never fires.
    pub fn register(
        &self,
        local_device: &str,
        reply_device: Option<String>,
        cloud_id: u64,
        timeout: Duration,
        on_timeout: CancelCallback,
    ) -> u64 {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = InFlight {
            local_device: local_device.to_string(),
            reply_device,
            cloud_id,
            deadline: Instant::now() + timeout,
            on_timeout: Some(on_timeout),
        };

        let superseded = {
            let mut table = self.table.lock();
            let previous = table
                .by_cloud
                .insert((local_device.to_string(), cloud_id), request_id)
                .and_then(|previous| table.by_id.remove(&previous).map(|entry| (previous, entry)));
            table.by_id.insert(request_id, entry);
            previous
        };
        if let Some((previous, entry)) = superseded {
            debug!(previous, cloud_id, "Superseded in-flight request");
            self.send_outbound(OutboundMessage::Reply(RpcReply::failure(
                entry.reply_device,
                entry.cloud_id,
                format!("request superseded by gateway request {}", request_id),
            )));
        }
        request_id
    }

    /// Complete a request with the connector's reply. Returns `false` for unknown or
    /// already finished requests, which are ignored.
    pub fn complete(&self, local_device: &str, cloud_id: u64, payload: Value) -> bool {
        let entry = {
            let mut table = self.table.lock();
            table
                .by_cloud
                .get(&(local_device.to_string(), cloud_id))
                .copied()
                .and_then(|request_id| table.remove(request_id))
        };
        let Some(entry) = entry else {
            debug!(device = %local_device, cloud_id, "Ignoring reply without a pending request");
            return false;
        };

        bump(&self.stats.rpc_replies);
        self.send_outbound(OutboundMessage::Reply(RpcReply::success(
            entry.reply_device,
            entry.cloud_id,
            payload,
        )));
        true
    }

    /// Fail a request immediately, e.g. because the connector rejected it.
    pub fn fail(&self, request_id: u64, error: &str) -> bool {
        let Some(entry) = self.table.lock().remove(request_id) else {
            return false;
        };
        self.send_outbound(OutboundMessage::Reply(RpcReply::failure(
            entry.reply_device,
            entry.cloud_id,
            error,
        )));
        true
    }

    /// Drop a request without replying.
    pub fn cancel(&self, request_id: u64) -> bool {
        self.table.lock().remove(request_id).is_some()
    }

    /// Expire every request whose deadline is before `now`. Returns how many expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut table = self.table.lock();
        let expired: Vec<u64> = table
            .by_id
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for request_id in &expired {
            let Some(mut entry) = table.remove(*request_id) else {
                continue;
            };
            if let Some(callback) = entry.on_timeout.take() {
                callback(*request_id);
            }
            bump(&self.stats.rpc_timeouts);
            warn!(
                request_id,
                cloud_id = entry.cloud_id,
                device = %entry.local_device,
                "RPC request timed out"
            );
            self.send_outbound(OutboundMessage::Reply(RpcReply::failure(
                entry.reply_device,
                entry.cloud_id,
                Error::RpcTimeout(entry.cloud_id).to_string(),
            )));
        }
        expired.len()
    }

    pub fn in_flight(&self) -> usize {
        self.table.lock().by_id.len()
    }

    /// Sweep on a fixed interval until `cancel` fires.
    pub async fn run_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
    }
}

impl std::fmt::Debug for RpcCorrelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCorrelation")
            .field("in_flight", &self.in_flight())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Routes inbound commands to connectors and built-in gateway methods.
pub struct RpcRouter {
    correlation: Arc<RpcCorrelation>,
    directory: Arc<DeviceDirectory>,
    connectors: Arc<ConnectorManager>,
    storage: SharedStorage,
    stats: Arc<GatewayStats>,
}

impl RpcRouter {
    pub fn new(
        correlation: Arc<RpcCorrelation>,
        directory: Arc<DeviceDirectory>,
        connectors: Arc<ConnectorManager>,
        storage: SharedStorage,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            correlation,
            directory,
            connectors,
            storage,
            stats,
        }
    }

    fn reply_now(&self, reply: RpcReply) {
        self.correlation.send_outbound(OutboundMessage::Reply(reply));
    }

    /// Route one command from the `v1/gateway/rpc` family.
    pub async fn dispatch(&self, request: RpcRequest) {
        if request.is_device_bound() {
            self.dispatch_to_device(request).await;
        } else {
            self.dispatch_unbound(request).await;
        }
    }

    async fn dispatch_to_device(&self, request: RpcRequest) {
        let cloud_device = request.device.clone();
        let cloud_id = request.data.id;

        let Some(device) = self.directory.resolve(&cloud_device) else {
            warn!(device = %cloud_device, "RPC for unknown device");
            self.reply_now(RpcReply::failure(
                Some(cloud_device.clone()),
                cloud_id,
                format!("device '{}' not found", cloud_device),
            ));
            return;
        };

        let timeout = request
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.correlation.default_timeout());
        let method = request.data.method.clone();
        let request_id = self.correlation.register(
            &device.name,
            Some(cloud_device.clone()),
            cloud_id,
            timeout,
            Box::new(move |request_id| {
                debug!(request_id, method = %method, "Timeout callback fired");
            }),
        );

        let mut forwarded = request;
        forwarded.device = device.name.clone();
        debug!(
            request_id,
            device = %device.name,
            connector = %device.connector_name,
            method = %forwarded.data.method,
            "Forwarding RPC to connector"
        );
        if let Err(e) = self
            .connectors
            .server_side_rpc(&device.connector_name, forwarded)
            .await
        {
            self.correlation.fail(request_id, &e.to_string());
        }
    }

    async fn dispatch_unbound(&self, request: RpcRequest) {
        let cloud_id = request.data.id;
        let Some((module, method)) = request.module_method() else {
            self.reply_now(RpcReply::failure(
                None,
                cloud_id,
                format!("unsupported method '{}'", request.data.method),
            ));
            return;
        };
        let (module, method) = (module.to_string(), method.to_string());

        if module == "gateway" {
            let reply = match self.gateway_method(&method, &request.data.params) {
                Ok(result) => RpcReply::success(None, cloud_id, result),
                Err(e) => RpcReply::failure(None, cloud_id, e.to_string()),
            };
            self.reply_now(reply);
            return;
        }

        let Some(connector) = self.connectors.find_by_type(&module) else {
            self.reply_now(RpcReply::failure(
                None,
                cloud_id,
                format!("no connector for module '{}'", module),
            ));
            return;
        };

        let timeout = request
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.correlation.default_timeout());
        let request_id = self.correlation.register(
            "",
            None,
            cloud_id,
            timeout,
            Box::new(|request_id| debug!(request_id, "Timeout callback fired")),
        );

        let mut forwarded = request;
        forwarded.data.method = method;
        if let Err(e) = self.connectors.server_side_rpc(&connector.name, forwarded).await {
            self.correlation.fail(request_id, &e.to_string());
        }
    }

    /// Command addressed to the gateway itself (`v1/devices/me/rpc/request/<id>`).
    pub fn dispatch_gateway(&self, request_id: u64, method: &str, params: &Value) {
        let name = method.strip_prefix("gateway_").unwrap_or(method);
        let reply = match self.gateway_method(name, params) {
            Ok(result) => RpcReply::success(None, request_id, result),
            Err(e) => RpcReply::failure(None, request_id, e.to_string()),
        };
        self.reply_now(reply);
    }

    /// Built-in gateway methods.
    pub fn gateway_method(&self, method: &str, params: &Value) -> neogate_core::Result<Value> {
        let param = |key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation(format!("missing parameter '{}'", key)))
        };

        match method {
            "ping" => Ok(json!({ "success": true, "result": "pong" })),
            "version" => Ok(json!({ "version": crate::VERSION })),
            "devices" => {
                let devices: serde_json::Map<String, Value> = self
                    .directory
                    .list()
                    .into_iter()
                    .map(|d| (d.cloud_name().to_string(), Value::from(d.connector_name)))
                    .collect();
                Ok(Value::Object(devices))
            }
            "stats" => {
                let queue = self.storage.read().len();
                Ok(serde_json::to_value(self.stats.snapshot(queue))?)
            }
            "device_renamed" => {
                let (old_name, new_name) = (param("oldName")?, param("newName")?);
                if self.directory.rename(old_name, new_name) {
                    Ok(json!({ "success": true }))
                } else {
                    Err(Error::NotFound(format!("device '{}'", old_name)))
                }
            }
            "device_deleted" => {
                let device = param("device")?;
                match self.directory.del_device(device) {
                    Some(_) => Ok(json!({ "success": true })),
                    None => Err(Error::NotFound(format!("device '{}'", device))),
                }
            }
            other => Err(Error::Validation(format!("unknown gateway method '{}'", other))),
        }
    }
}

impl std::fmt::Debug for RpcRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRouter").finish_non_exhaustive()
    }
}

async fn send_one(uplink: &Arc<dyn Uplink>, message: &OutboundMessage) {
    let handle = match message {
        OutboundMessage::Reply(reply) => {
            uplink
                .send_rpc_reply(reply.device.as_deref(), reply.request_id, &reply.payload, QoS::AtLeastOnce)
                .await
        }
        OutboundMessage::DeviceConnected {
            device,
            device_type,
        } => uplink.send_device_connect(device, device_type).await,
        OutboundMessage::DeviceDisconnected { device } => {
            uplink.send_device_disconnect(device).await
        }
    };
    if !handle.rc().is_success() {
        warn!(rc = ?handle.rc(), message = ?message, "Outbound message not sent");
    }
}

/// Drain the outbound channel onto the current uplink until `cancel` fires.
pub async fn run_reply_sender(
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    uplink: SharedUplink,
    cancel: CancellationToken,
) {
    info!("Reply sender started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                let current = uplink.read().clone();
                send_one(&current, &message).await;
            }
        }
    }
    info!("Reply sender stopped");
}
