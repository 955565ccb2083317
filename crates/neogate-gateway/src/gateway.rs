//! Gateway service.
//!
//! Owns every shared component, hands connectors their [`GatewaySink`], and runs the
//! fixed set of background workers: delivery, reply sender, RPC sweeper, configuration
//! poller, idle-device reaper, downlink handler and the directory event forwarder.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use neogate_core::{
    ConnectorIdentity, ConnectorRegistry, ConvertedData, DedupFilter, DeviceFilter,
    DownlinkMessage, Error, GatewayConfig, GatewaySink, IngestStatus, QoS, Result, RpcReply,
    UplinkFactory,
};
use neogate_storage::{GatewayStateStore, create_event_storage};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::DeliveryEngine;
use crate::directory::{DeviceDirectory, DirectoryEvent};
use crate::ingestion::IngestionPipeline;
use crate::manager::ConnectorManager;
use crate::reconfig::{ReconfigTargets, Reconfigurator};
use crate::rpc::{OutboundMessage, RpcCorrelation, RpcRouter, run_reply_sender};
use crate::stats::{GatewayStats, StatsSnapshot};
use crate::{PackGate, SharedStorage, SharedUplink};

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// The [`GatewaySink`] handed to every connector.
pub struct CoreSink {
    ingestion: IngestionPipeline,
    directory: Arc<DeviceDirectory>,
    rpc: Arc<RpcCorrelation>,
}

impl GatewaySink for CoreSink {
    fn send_to_storage(&self, connector: &ConnectorIdentity, data: ConvertedData) -> IngestStatus {
        self.ingestion.ingest(connector, data)
    }

    fn send_rpc_reply(&self, connector: &ConnectorIdentity, reply: RpcReply) {
        let device = reply.device.unwrap_or_default();
        if !self.rpc.complete(&device, reply.request_id, reply.payload) {
            debug!(
                connector = %connector.name,
                device = %device,
                request_id = reply.request_id,
                "Late or unknown RPC reply dropped"
            );
        }
    }

    fn add_device(&self, connector: &ConnectorIdentity, device_name: &str, device_type: &str) {
        self.directory.add_device(device_name, connector, device_type);
    }

    fn del_device(&self, connector: &ConnectorIdentity, device_name: &str) {
        if let Some((owner, _)) = self.directory.owner(device_name)
            && owner != connector.name
        {
            warn!(
                connector = %connector.name,
                owner = %owner,
                device = %device_name,
                "Connector tried to remove a device it does not own"
            );
            return;
        }
        self.directory.del_device(device_name);
    }
}

impl std::fmt::Debug for CoreSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreSink").finish_non_exhaustive()
    }
}

struct Receivers {
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    downlink: mpsc::UnboundedReceiver<DownlinkMessage>,
    directory: mpsc::UnboundedReceiver<DirectoryEvent>,
}

pub struct Gateway {
    config: Arc<Mutex<GatewayConfig>>,
    stats: Arc<GatewayStats>,
    directory: Arc<DeviceDirectory>,
    storage: SharedStorage,
    uplink: SharedUplink,
    dedup: Arc<DedupFilter>,
    rpc: Arc<RpcCorrelation>,
    sink: Arc<CoreSink>,
    connectors: Arc<ConnectorManager>,
    router: Arc<RpcRouter>,
    delivery: Arc<DeliveryEngine>,
    reconfigurator: Arc<Reconfigurator>,
    cancel: CancellationToken,
    started: AtomicBool,
    receivers: Mutex<Option<Receivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Build every component. Nothing runs until [`Gateway::start`].
    pub fn new(
        config: GatewayConfig,
        config_path: Option<PathBuf>,
        registry: ConnectorRegistry,
        uplink_factory: Arc<dyn UplinkFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(GatewayStats::new());

        let state = Arc::new(GatewayStateStore::open(config.state_path())?);
        let (directory_tx, directory_rx) = mpsc::unbounded_channel();
        let directory = Arc::new(DeviceDirectory::new(state.clone()).with_events(directory_tx));

        let storage: SharedStorage = Arc::new(RwLock::new(create_event_storage(&config.storage)?));
        let (downlink_tx, downlink_rx) = mpsc::unbounded_channel();
        let uplink: SharedUplink = Arc::new(RwLock::new(
            uplink_factory.create(&config.uplink, downlink_tx.clone())?,
        ));
        let gate: PackGate = Arc::new(tokio::sync::Mutex::new(()));

        let dedup = Arc::new(DedupFilter::new(config.dedup.ttl()));
        let filter = DeviceFilter::from_config(&config.device_filter)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(RpcCorrelation::new(
            config.rpc.default_timeout(),
            outbound_tx,
            stats.clone(),
        ));

        let ingestion = IngestionPipeline::new(
            directory.clone(),
            storage.clone(),
            dedup.clone(),
            filter,
            config.delivery.max_payload_size_bytes,
            stats.clone(),
        )
        .with_dedup_for_all(config.dedup.enabled);
        let sink = Arc::new(CoreSink {
            ingestion,
            directory: directory.clone(),
            rpc: rpc.clone(),
        });

        let mut manager = ConnectorManager::new(registry, sink.clone(), stats.clone())
            .with_key_store(state);
        if let Some(path) = &config_path {
            manager = manager.with_config_path(path);
        }
        let connectors = Arc::new(manager);

        let router = Arc::new(RpcRouter::new(
            rpc.clone(),
            directory.clone(),
            connectors.clone(),
            storage.clone(),
            stats.clone(),
        ));
        let delivery = Arc::new(DeliveryEngine::new(
            storage.clone(),
            uplink.clone(),
            gate.clone(),
            config.delivery.clone(),
            QoS::from_level(config.uplink.qos),
            stats.clone(),
        ));

        let config = Arc::new(Mutex::new(config));
        let reconfigurator = Arc::new(Reconfigurator::new(
            config.clone(),
            config_path,
            ReconfigTargets {
                uplink: uplink.clone(),
                storage: storage.clone(),
                gate,
                connectors: connectors.clone(),
            },
            uplink_factory,
            downlink_tx,
        ));

        Ok(Self {
            config,
            stats,
            directory,
            storage,
            uplink,
            dedup,
            rpc,
            sink,
            connectors,
            router,
            delivery,
            reconfigurator,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            receivers: Mutex::new(Some(Receivers {
                outbound: outbound_rx,
                downlink: downlink_rx,
                directory: directory_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect the uplink, restore the directory, open connectors and spawn workers.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Config("gateway already started".into()));
        }
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| Error::Config("gateway cannot be restarted".into()))?;

        let uplink = self.uplink.read().clone();
        uplink.connect().await?;

        let devices = self.directory.load()?;
        let config = self.config.lock().clone();
        let loaded = self.connectors.load_connectors(&config.connectors);
        let opened = self.connectors.connect_all().await;
        info!(devices, loaded, opened, uplink = uplink.name(), "Gateway starting");

        let mut tasks = Vec::new();

        let delivery = self.delivery.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { delivery.run(cancel).await }));

        tasks.push(tokio::spawn(run_reply_sender(
            receivers.outbound,
            self.uplink.clone(),
            self.cancel.clone(),
        )));

        let rpc = self.rpc.clone();
        let cancel = self.cancel.clone();
        let sweep = Duration::from_millis(config.rpc.sweep_interval_ms);
        tasks.push(tokio::spawn(async move { rpc.run_sweeper(sweep, cancel).await }));

        if config.check_connectors_configuration_secs > 0 {
            tasks.push(tokio::spawn(run_config_poller(
                self.reconfigurator.clone(),
                Duration::from_secs(config.check_connectors_configuration_secs),
                self.cancel.clone(),
            )));
        }

        tasks.push(tokio::spawn(run_idle_reaper(
            self.directory.clone(),
            self.connectors.clone(),
            Duration::from_secs(config.idle_check_period_secs.max(1)),
            self.cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_downlink_handler(
            receivers.downlink,
            DownlinkContext {
                router: self.router.clone(),
                directory: self.directory.clone(),
                connectors: self.connectors.clone(),
                reconfigurator: self.reconfigurator.clone(),
            },
            self.cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_directory_forwarder(
            receivers.directory,
            self.dedup.clone(),
            self.rpc.clone(),
            self.cancel.clone(),
        )));

        *self.tasks.lock() = tasks;
        info!("Gateway started");
        Ok(())
    }

    /// Stop workers and connectors, then release the uplink and the event storage.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.cancel.cancel();
        self.connectors.close_all().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("Worker did not stop in time, aborting");
                task.abort();
            }
        }

        let uplink = self.uplink.read().clone();
        uplink.disconnect().await;
        self.storage.read().stop();
        info!("Gateway stopped");
    }

    /// Ingest a record on behalf of a connector, as its context would.
    pub fn ingest(&self, connector: &ConnectorIdentity, data: ConvertedData) -> IngestStatus {
        self.sink.send_to_storage(connector, data)
    }

    pub fn sink(&self) -> Arc<dyn GatewaySink> {
        self.sink.clone()
    }

    pub fn directory(&self) -> &Arc<DeviceDirectory> {
        &self.directory
    }

    pub fn connectors(&self) -> &Arc<ConnectorManager> {
        &self.connectors
    }

    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    pub fn rpc(&self) -> &Arc<RpcCorrelation> {
        &self.rpc
    }

    pub fn delivery(&self) -> &Arc<DeliveryEngine> {
        &self.delivery
    }

    pub fn reconfigurator(&self) -> &Arc<Reconfigurator> {
        &self.reconfigurator
    }

    pub fn config(&self) -> GatewayConfig {
        self.config.lock().clone()
    }

    pub fn queue_len(&self) -> usize {
        self.storage.read().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.queue_len())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("connectors", &self.connectors)
            .finish_non_exhaustive()
    }
}

async fn run_config_poller(
    reconfigurator: Arc<Reconfigurator>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match reconfigurator.reload_from_file().await {
            Ok(_) => {}
            Err(Error::Reconfiguration(reason)) => {
                debug!(%reason, "Configuration file check deferred");
            }
            Err(e) => error!(error = %e, "Connector configuration check failed"),
        }
    }
}

async fn run_idle_reaper(
    directory: Arc<DeviceDirectory>,
    connectors: Arc<ConnectorManager>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let thresholds = connectors.idle_thresholds();
        if thresholds.is_empty() {
            continue;
        }
        for device in directory.idle_devices(Utc::now(), &thresholds) {
            info!(
                device = %device.name,
                connector = %device.connector_name,
                last_activity = %device.last_activity,
                "Disconnecting idle device"
            );
            directory.del_device(&device.name);
        }
    }
}

struct DownlinkContext {
    router: Arc<RpcRouter>,
    directory: Arc<DeviceDirectory>,
    connectors: Arc<ConnectorManager>,
    reconfigurator: Arc<Reconfigurator>,
}

impl DownlinkContext {
    fn handle(&self, message: DownlinkMessage) {
        match message {
            DownlinkMessage::Rpc(request) => {
                let router = self.router.clone();
                tokio::spawn(async move { router.dispatch(request).await });
            }
            DownlinkMessage::GatewayRpc {
                request_id,
                method,
                params,
            } => self.router.dispatch_gateway(request_id, &method, &params),
            DownlinkMessage::AttributeUpdate(mut update) => {
                let Some(device) = self.directory.resolve(&update.device) else {
                    warn!(device = %update.device, "Attribute update for unknown device");
                    return;
                };
                update.device = device.name;
                let connector_name = device.connector_name;
                let connectors = self.connectors.clone();
                tokio::spawn(async move {
                    let _ = connectors.on_attributes_update(&connector_name, update).await;
                });
            }
            DownlinkMessage::Configuration(update) => {
                let reconfigurator = self.reconfigurator.clone();
                tokio::spawn(async move {
                    let _ = reconfigurator.apply(update).await;
                });
            }
        }
    }
}

async fn run_downlink_handler(
    mut downlink: mpsc::UnboundedReceiver<DownlinkMessage>,
    context: DownlinkContext,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = downlink.recv() => match message {
                Some(message) => context.handle(message),
                None => break,
            },
        }
    }
}

async fn run_directory_forwarder(
    mut events: mpsc::UnboundedReceiver<DirectoryEvent>,
    dedup: Arc<DedupFilter>,
    rpc: Arc<RpcCorrelation>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            DirectoryEvent::Added {
                cloud_name,
                device_type,
                ..
            } => rpc.send_outbound(OutboundMessage::DeviceConnected {
                device: cloud_name,
                device_type,
            }),
            DirectoryEvent::Removed { name, cloud_name } => {
                dedup.remove_device(&name);
                rpc.send_outbound(OutboundMessage::DeviceDisconnected { device: cloud_name });
            }
        }
    }
}
