//! Common test utilities for gateway tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use neogate_core::{
    AttributeUpdate, Attributes, Connector, ConnectorConfig, ConnectorContext, ConnectorRegistry,
    DownlinkSender, Error, GatewayConfig, PublishHandle, PublishResult, QoS, Result, RpcRequest,
    TelemetryPoint, Uplink, UplinkConfig, UplinkFactory,
};
use neogate_gateway::Gateway;
use parking_lot::Mutex;
use serde_json::Value;

/// Everything a [`MockUplink`] was asked to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Attributes { device: String, attributes: Attributes },
    Telemetry { device: String, points: Vec<TelemetryPoint> },
    Reply { device: Option<String>, request_id: u64, payload: Value },
    Connect { device: String, device_type: String },
    Disconnect { device: String },
}

pub struct MockUplink {
    pub config: UplinkConfig,
    connectable: bool,
    connected: AtomicBool,
    closed: AtomicBool,
    nack: AtomicBool,
    drop_link_after: Mutex<Option<usize>>,
    sent: Mutex<Vec<Sent>>,
}

impl MockUplink {
    pub fn new(config: UplinkConfig, connectable: bool) -> Self {
        Self {
            config,
            connectable,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            nack: AtomicBool::new(false),
            drop_link_after: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answer every following publish with a failed acknowledgment.
    pub fn set_nack(&self, nack: bool) {
        self.nack.store(nack, Ordering::SeqCst);
    }

    /// Drop the link once `sends` more publishes went out.
    pub fn drop_link_after(&self, sends: usize) {
        let already = self.sent.lock().len();
        *self.drop_link_after.lock() = Some(already + sends);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Forget what was sent and any pending link drop.
    pub fn clear(&self) {
        self.sent.lock().clear();
        *self.drop_link_after.lock() = None;
    }

    pub fn telemetry_for(&self, device: &str) -> Vec<TelemetryPoint> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Telemetry { device: d, points } if d == device => Some(points),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn replies(&self) -> Vec<(Option<String>, u64, Value)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Reply {
                    device,
                    request_id,
                    payload,
                } => Some((device, request_id, payload)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, sent: Sent) -> PublishHandle {
        if !self.connected.load(Ordering::SeqCst) {
            return PublishHandle::completed(PublishResult::NotConnected);
        }
        let count = {
            let mut log = self.sent.lock();
            log.push(sent);
            log.len()
        };
        if let Some(limit) = *self.drop_link_after.lock()
            && count >= limit
        {
            self.connected.store(false, Ordering::SeqCst);
        }
        if self.nack.load(Ordering::SeqCst) {
            PublishHandle::completed(PublishResult::Error("nack".into()))
        } else {
            PublishHandle::completed(PublishResult::Success)
        }
    }
}

#[async_trait]
impl Uplink for MockUplink {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        if self.connectable {
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn send_attributes(&self, device: &str, attributes: &Attributes, _qos: QoS) -> PublishHandle {
        self.record(Sent::Attributes {
            device: device.to_string(),
            attributes: attributes.clone(),
        })
    }

    async fn send_telemetry(&self, device: &str, telemetry: &[TelemetryPoint], _qos: QoS) -> PublishHandle {
        self.record(Sent::Telemetry {
            device: device.to_string(),
            points: telemetry.to_vec(),
        })
    }

    async fn send_rpc_reply(
        &self,
        device: Option<&str>,
        request_id: u64,
        payload: &Value,
        _qos: QoS,
    ) -> PublishHandle {
        self.record(Sent::Reply {
            device: device.map(str::to_string),
            request_id,
            payload: payload.clone(),
        })
    }

    async fn send_device_connect(&self, device: &str, device_type: &str) -> PublishHandle {
        self.record(Sent::Connect {
            device: device.to_string(),
            device_type: device_type.to_string(),
        })
    }

    async fn send_device_disconnect(&self, device: &str) -> PublishHandle {
        self.record(Sent::Disconnect {
            device: device.to_string(),
        })
    }
}

/// Factory keeping every uplink it built.
pub struct MockUplinkFactory {
    connectable: AtomicBool,
    created: Mutex<Vec<Arc<MockUplink>>>,
    downlink: Mutex<Option<DownlinkSender>>,
}

impl MockUplinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connectable: AtomicBool::new(true),
            created: Mutex::new(Vec::new()),
            downlink: Mutex::new(None),
        })
    }

    /// Whether uplinks built from now on reach the connected state.
    pub fn set_connectable(&self, connectable: bool) {
        self.connectable.store(connectable, Ordering::SeqCst);
    }

    pub fn latest(&self) -> Arc<MockUplink> {
        self.created.lock().last().cloned().expect("no uplink created")
    }

    pub fn get(&self, index: usize) -> Arc<MockUplink> {
        self.created.lock()[index].clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    /// Sender the gateway listens on, as an uplink would use it.
    pub fn downlink(&self) -> DownlinkSender {
        self.downlink.lock().clone().expect("no uplink created")
    }
}

impl UplinkFactory for MockUplinkFactory {
    fn create(&self, config: &UplinkConfig, downlink: DownlinkSender) -> Result<Arc<dyn Uplink>> {
        *self.downlink.lock() = Some(downlink);
        let uplink = Arc::new(MockUplink::new(
            config.clone(),
            self.connectable.load(Ordering::SeqCst),
        ));
        self.created.lock().push(uplink.clone());
        Ok(uplink)
    }
}

/// What test connectors saw, shared by every instance of the `valve` type.
#[derive(Default)]
pub struct Recorder {
    pub requests: Mutex<Vec<RpcRequest>>,
    pub updates: Mutex<Vec<AttributeUpdate>>,
    pub contexts: Mutex<Vec<ConnectorContext>>,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Recorder {
    pub fn context(&self, name: &str) -> ConnectorContext {
        self.contexts
            .lock()
            .iter()
            .rev()
            .find(|c| c.identity().name == name)
            .cloned()
            .expect("connector not constructed")
    }
}

/// Connector used by the tests. Configuration flags:
/// `auto_reply` answers every command, `fail_open` makes `open` fail.
pub struct ValveConnector {
    name: String,
    config: Value,
    context: ConnectorContext,
    connected: AtomicBool,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Connector for ValveConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "valve"
    }

    fn config(&self) -> &Value {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if self.config.get("fail_open").is_some() {
            return Err(Error::Connector("serial port busy".into()));
        }
        self.recorder.opens.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn on_attributes_update(&self, update: AttributeUpdate) -> Result<()> {
        self.recorder.updates.lock().push(update);
        Ok(())
    }

    async fn server_side_rpc_handler(&self, request: RpcRequest) -> Result<()> {
        self.recorder.requests.lock().push(request.clone());
        if self.config.get("auto_reply").is_some() {
            let device = (!request.device.is_empty()).then(|| request.device.clone());
            self.context.send_rpc_reply(
                device,
                request.data.id,
                serde_json::json!({ "done": request.data.method }),
            );
        }
        Ok(())
    }
}

pub fn registry(recorder: Arc<Recorder>) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register("valve", move |config: ConnectorConfig, context: ConnectorContext| {
        recorder.contexts.lock().push(context.clone());
        Ok(Arc::new(ValveConnector {
            name: config.name,
            config: config.configuration,
            context,
            connected: AtomicBool::new(false),
            recorder: recorder.clone(),
        }) as Arc<dyn Connector>)
    });
    registry
}

pub fn valve(name: &str, configuration: Value) -> ConnectorConfig {
    let mut config = ConnectorConfig::new(name, "valve");
    config.configuration = configuration;
    config
}

/// Configuration with state under `dir`, no config poller and fast workers.
pub fn test_config(dir: &Path) -> GatewayConfig {
    let mut config = GatewayConfig {
        data_dir: dir.join("state"),
        check_connectors_configuration_secs: 0,
        ..Default::default()
    };
    config.rpc.sweep_interval_ms = 20;
    config.delivery.idle_poll_ms = 10;
    config.delivery.link_retry_ms = 10;
    config.delivery.min_pack_send_delay_ms = 0;
    config.delivery.ack_timeout_secs = 1;
    config.uplink.connect_timeout_secs = 1;
    config
}

pub struct TestGateway {
    pub gateway: Gateway,
    pub factory: Arc<MockUplinkFactory>,
    pub recorder: Arc<Recorder>,
}

impl TestGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_path(config, None)
    }

    pub fn with_path(config: GatewayConfig, path: Option<&Path>) -> Self {
        let factory = MockUplinkFactory::new();
        let recorder = Arc::new(Recorder::default());
        let gateway = Gateway::new(
            config,
            path.map(Path::to_path_buf),
            registry(recorder.clone()),
            factory.clone(),
        )
        .unwrap();
        Self {
            gateway,
            factory,
            recorder,
        }
    }

    /// The uplink the gateway was built with.
    pub fn uplink(&self) -> Arc<MockUplink> {
        self.factory.get(0)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
