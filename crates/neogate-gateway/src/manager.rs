//! Connector lifecycle manager.
//!
//! Instantiates connectors from configuration through the [`ConnectorRegistry`], opens and
//! closes them, and reloads the whole set when a configuration file changes on disk.
//! Every call into a connector is guarded: errors and panics are logged with the
//! connector's identity and counted, never propagated into the gateway's own loops.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use neogate_core::{
    AttributeUpdate, Connector, ConnectorConfig, ConnectorContext, ConnectorIdentity,
    ConnectorRegistry, Error, GatewayConfig, GatewaySink, Result, RpcRequest,
};
use neogate_storage::GatewayStateStore;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::stats::GatewayStats;

/// A loaded connector together with the identity it was given.
pub struct ManagedConnector {
    pub name: String,
    pub identity: ConnectorIdentity,
    pub config: ConnectorConfig,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for ManagedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnector")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Status row for one connector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorStatus {
    pub name: String,
    pub connector_type: String,
    pub id: String,
    pub connected: bool,
}

type Stamps = HashMap<PathBuf, Option<SystemTime>>;

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub struct ConnectorManager {
    registry: ConnectorRegistry,
    sink: Arc<dyn GatewaySink>,
    keys: Option<Arc<GatewayStateStore>>,
    stats: Arc<GatewayStats>,
    connectors: RwLock<Vec<Arc<ManagedConnector>>>,
    configs: RwLock<Vec<ConnectorConfig>>,
    config_path: Option<PathBuf>,
    base_dir: PathBuf,
    stamps: Mutex<Stamps>,
}

impl ConnectorManager {
    pub fn new(registry: ConnectorRegistry, sink: Arc<dyn GatewaySink>, stats: Arc<GatewayStats>) -> Self {
        Self {
            registry,
            sink,
            keys: None,
            stats,
            connectors: RwLock::new(Vec::new()),
            configs: RwLock::new(Vec::new()),
            config_path: None,
            base_dir: PathBuf::from("."),
            stamps: Mutex::new(HashMap::new()),
        }
    }

    /// Persist generated connector ids in `store`.
    pub fn with_key_store(mut self, store: Arc<GatewayStateStore>) -> Self {
        self.keys = Some(store);
        self
    }

    /// Watch the main configuration file. Relative `configuration_file`s resolve against
    /// its directory.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            self.base_dir = parent.to_path_buf();
        }
        self.config_path = Some(path);
        self
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    fn connector_id(&self, config: &ConnectorConfig) -> Result<String> {
        if let Some(id) = &config.id {
            return Ok(id.clone());
        }
        match &self.keys {
            Some(store) => Ok(store.connector_key(&config.name)?),
            None => Ok(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Build one connector without opening it.
    pub fn instantiate(&self, config: &ConnectorConfig) -> Result<Arc<ManagedConnector>> {
        let mut config = config.clone();
        config.resolve_configuration(&self.base_dir)?;
        let id = self.connector_id(&config)?;
        let identity = ConnectorIdentity::new(config.name.as_str(), id, config.connector_type.as_str())
            .with_dedup(config.send_data_only_on_change);
        let context = ConnectorContext::new(identity.clone(), self.sink.clone());

        let created = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.create(config.clone(), context)
        }))
        .map_err(|_| Error::Connector(format!("constructor of '{}' panicked", config.name)))??;

        Ok(Arc::new(ManagedConnector {
            name: config.name.clone(),
            identity,
            config,
            connector: created,
        }))
    }

    fn instantiate_logged(&self, configs: &[ConnectorConfig]) -> Vec<Arc<ManagedConnector>> {
        let mut loaded = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            match self.instantiate(config) {
                Ok(connector) => {
                    info!(
                        connector = %config.name,
                        connector_type = %config.connector_type,
                        id = %connector.identity.id,
                        "Connector loaded"
                    );
                    loaded.push(connector);
                }
                Err(e) => {
                    self.stats.record_error(&config.name, &e);
                    error!(connector = %config.name, error = %e, "Failed to load connector");
                }
            }
        }
        loaded
    }

    /// Instantiate every enabled connector. Failures are logged per connector and the
    /// rest still load. Returns how many loaded.
    pub fn load_connectors(&self, configs: &[ConnectorConfig]) -> usize {
        let loaded = self.instantiate_logged(configs);
        let count = loaded.len();
        *self.connectors.write() = loaded;
        *self.configs.write() = configs.to_vec();
        *self.stamps.lock() = self.current_stamps(configs);
        count
    }

    async fn guarded<T>(
        &self,
        connector: &str,
        action: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "panicked".to_string(),
        };
        self.stats.record_error(connector, &outcome);
        error!(connector = %connector, action, error = %outcome, "Connector call failed");
        Err(Error::Connector(format!("{}: {} failed: {}", connector, action, outcome)))
    }

    async fn open_one(&self, managed: &ManagedConnector) -> Result<()> {
        self.guarded(&managed.name, "open", managed.connector.open()).await?;
        self.stats.set_connected(&managed.name, true);
        info!(connector = %managed.name, "Connector opened");
        Ok(())
    }

    async fn close_one(&self, managed: &ManagedConnector) {
        if AssertUnwindSafe(managed.connector.close())
            .catch_unwind()
            .await
            .is_err()
        {
            self.stats.record_error(&managed.name, "close panicked");
            error!(connector = %managed.name, "Connector panicked while closing");
        }
        self.stats.set_connected(&managed.name, false);
        debug!(connector = %managed.name, "Connector closed");
    }

    /// Open every loaded connector. Returns how many opened.
    pub async fn connect_all(&self) -> usize {
        let connectors = self.connectors.read().clone();
        let mut opened = 0;
        for managed in &connectors {
            if self.open_one(managed).await.is_ok() {
                opened += 1;
            }
        }
        opened
    }

    /// Close and unload every connector.
    pub async fn close_all(&self) {
        let connectors = std::mem::take(&mut *self.connectors.write());
        self.close_set(&connectors).await;
    }

    pub async fn close_set(&self, set: &[Arc<ManagedConnector>]) {
        for managed in set {
            self.close_one(managed).await;
        }
    }

    /// Instantiate and open a complete set. Any failure closes what was opened.
    pub async fn open_set(&self, configs: &[ConnectorConfig]) -> Result<Vec<Arc<ManagedConnector>>> {
        let mut set = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            match self.instantiate(config) {
                Ok(managed) => set.push(managed),
                Err(e) => {
                    return Err(Error::Reconfiguration(format!(
                        "connector '{}': {}",
                        config.name, e
                    )));
                }
            }
        }

        for (index, managed) in set.iter().enumerate() {
            if let Err(e) = self.open_one(managed).await {
                self.close_set(&set[..=index]).await;
                return Err(Error::Reconfiguration(e.to_string()));
            }
        }
        Ok(set)
    }

    /// Install `set` as the running connectors. Returns the previous set.
    pub fn replace_all(
        &self,
        set: Vec<Arc<ManagedConnector>>,
        configs: &[ConnectorConfig],
    ) -> Vec<Arc<ManagedConnector>> {
        let previous = std::mem::replace(&mut *self.connectors.write(), set);
        *self.configs.write() = configs.to_vec();
        *self.stamps.lock() = self.current_stamps(configs);
        previous
    }

    fn current_stamps(&self, configs: &[ConnectorConfig]) -> Stamps {
        let mut stamps = Stamps::new();
        if let Some(path) = &self.config_path {
            stamps.insert(path.clone(), modified(path));
        }
        for path in configs
            .iter()
            .filter_map(|c| c.configuration_path(&self.base_dir))
        {
            let stamp = modified(&path);
            stamps.insert(path, stamp);
        }
        stamps
    }

    /// Whether the main configuration or any connector configuration file changed since
    /// the last load.
    pub fn has_file_changes(&self) -> bool {
        let configs = self.configs.read().clone();
        self.current_stamps(&configs) != *self.stamps.lock()
    }

    /// Accept the files as they are now without reloading.
    pub fn refresh_stamps(&self) {
        let configs = self.configs.read().clone();
        *self.stamps.lock() = self.current_stamps(&configs);
    }

    /// Reload every connector if the main configuration or any connector configuration
    /// file changed since the last load. Returns the connector list now running, or `None`
    /// when nothing changed.
    pub async fn check_configuration_updates(&self) -> Result<Option<Vec<ConnectorConfig>>> {
        if !self.has_file_changes() {
            return Ok(None);
        }
        let configs = self.configs.read().clone();

        let configs = match &self.config_path {
            Some(path) => match GatewayConfig::load(path) {
                Ok(config) => config.connectors,
                Err(e) => {
                    self.refresh_stamps();
                    warn!(path = %path.display(), error = %e, "Changed configuration is invalid, keeping connectors");
                    return Err(e);
                }
            },
            None => configs,
        };

        info!(connectors = configs.len(), "Configuration changed, reloading connectors");
        self.close_all().await;
        let loaded = self.load_connectors(&configs);
        let opened = self.connect_all().await;
        info!(loaded, opened, "Connectors reloaded");
        Ok(Some(configs))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedConnector>> {
        self.connectors.read().iter().find(|c| c.name == name).cloned()
    }

    /// First loaded connector of `connector_type`.
    pub fn find_by_type(&self, connector_type: &str) -> Option<Arc<ManagedConnector>> {
        self.connectors
            .read()
            .iter()
            .find(|c| c.identity.connector_type == connector_type)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.connectors.read().iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.read().is_empty()
    }

    pub fn statuses(&self) -> Vec<ConnectorStatus> {
        self.connectors
            .read()
            .iter()
            .map(|c| ConnectorStatus {
                name: c.name.clone(),
                connector_type: c.identity.connector_type.clone(),
                id: c.identity.id.clone(),
                connected: c.connector.is_connected(),
            })
            .collect()
    }

    /// Configuration of the current set, as last loaded.
    pub fn configs(&self) -> Vec<ConnectorConfig> {
        self.configs.read().clone()
    }

    /// Connector name to idle-disconnect threshold, for connectors that set one.
    pub fn idle_thresholds(&self) -> HashMap<String, Duration> {
        self.configs
            .read()
            .iter()
            .filter_map(|c| {
                c.inactivity_timeout_secs
                    .map(|secs| (c.name.clone(), Duration::from_secs(secs)))
            })
            .collect()
    }

    /// Forward a command to `connector_name`.
    pub async fn server_side_rpc(&self, connector_name: &str, request: RpcRequest) -> Result<()> {
        let managed = self
            .get(connector_name)
            .ok_or_else(|| Error::NotFound(format!("connector '{}'", connector_name)))?;
        self.guarded(
            connector_name,
            "server_side_rpc_handler",
            managed.connector.server_side_rpc_handler(request),
        )
        .await
    }

    /// Forward a shared attribute update to `connector_name`.
    pub async fn on_attributes_update(&self, connector_name: &str, update: AttributeUpdate) -> Result<()> {
        let managed = self
            .get(connector_name)
            .ok_or_else(|| Error::NotFound(format!("connector '{}'", connector_name)))?;
        self.guarded(
            connector_name,
            "on_attributes_update",
            managed.connector.on_attributes_update(update),
        )
        .await
    }
}

impl std::fmt::Debug for ConnectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorManager")
            .field("connectors", &self.names())
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use neogate_core::{ConvertedData, IngestStatus, RpcReply};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullSink;

    impl GatewaySink for NullSink {
        fn send_to_storage(&self, _: &ConnectorIdentity, _: ConvertedData) -> IngestStatus {
            IngestStatus::Success
        }
        fn send_rpc_reply(&self, _: &ConnectorIdentity, _: RpcReply) {}
        fn add_device(&self, _: &ConnectorIdentity, _: &str, _: &str) {}
        fn del_device(&self, _: &ConnectorIdentity, _: &str) {}
    }

    struct TestConnector {
        name: String,
        config: Value,
        connected: AtomicBool,
        fail_open: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for TestConnector {
        fn name(&self) -> &str {
            &self.name
        }
        fn connector_type(&self) -> &str {
            "test"
        }
        fn config(&self) -> &Value {
            &self.config
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn open(&self) -> Result<()> {
            if self.fail_open {
                return Err(Error::Connector("port busy".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_attributes_update(&self, _: AttributeUpdate) -> Result<()> {
            Ok(())
        }
        async fn server_side_rpc_handler(&self, _: RpcRequest) -> Result<()> {
            panic!("handler bug");
        }
    }

    fn manager(closes: Arc<AtomicUsize>) -> ConnectorManager {
        let mut registry = ConnectorRegistry::new();
        registry.register("test", move |config, _ctx| {
            if config.name == "broken" {
                return Err(Error::Config("bad register map".into()));
            }
            Ok(Arc::new(TestConnector {
                fail_open: config.configuration.get("fail_open").is_some(),
                name: config.name,
                config: config.configuration,
                connected: AtomicBool::new(false),
                closes: closes.clone(),
            }) as Arc<dyn Connector>)
        });
        ConnectorManager::new(registry, Arc::new(NullSink), Arc::new(GatewayStats::new()))
    }

    #[tokio::test]
    async fn test_load_skips_failing_connectors() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        let mut disabled = ConnectorConfig::new("off", "test");
        disabled.enabled = false;
        let configs = vec![
            ConnectorConfig::new("a", "test"),
            ConnectorConfig::new("broken", "test"),
            ConnectorConfig::new("ghost", "unknown"),
            disabled,
        ];
        assert_eq!(manager.load_connectors(&configs), 1);
        assert_eq!(manager.connect_all().await, 1);
        assert!(manager.statuses()[0].connected);
        assert_eq!(manager.stats.connector("broken").unwrap().errors, 1);
    }

    #[tokio::test]
    async fn test_find_by_type_and_close_all() {
        let closes = Arc::new(AtomicUsize::new(0));
        let manager = manager(closes.clone());
        manager.load_connectors(&[ConnectorConfig::new("a", "test"), ConnectorConfig::new("b", "test")]);
        assert_eq!(manager.find_by_type("test").unwrap().name, "a");
        assert!(manager.find_by_type("modbus").is_none());

        manager.close_all().await;
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_connector_panic_is_contained() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        manager.load_connectors(&[ConnectorConfig::new("a", "test")]);
        let result = manager
            .server_side_rpc("a", RpcRequest::new("d1", 1, "reset", Value::Null))
            .await;
        assert!(matches!(result, Err(Error::Connector(_))));
        assert_eq!(manager.stats.connector("a").unwrap().errors, 1);
    }

    #[tokio::test]
    async fn test_open_set_closes_partial_set_on_failure() {
        let closes = Arc::new(AtomicUsize::new(0));
        let manager = manager(closes.clone());
        let mut bad = ConnectorConfig::new("b", "test");
        bad.configuration = serde_json::json!({"fail_open": true});

        let result = manager.open_set(&[ConnectorConfig::new("a", "test"), bad]).await;
        assert!(matches!(result, Err(Error::Reconfiguration(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reload_on_configuration_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("gateway.toml");
        let file = dir.path().join("a.json");
        std::fs::write(
            &main,
            "[[connectors]]\nname = \"a\"\ntype = \"test\"\nconfiguration_file = \"a.json\"\n",
        )
        .unwrap();
        std::fs::write(&file, r#"{"unit": 1}"#).unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        let manager = manager(closes.clone()).with_config_path(&main);
        let configs = GatewayConfig::load(&main).unwrap().connectors;
        manager.load_connectors(&configs);
        manager.connect_all().await;
        assert_eq!(manager.get("a").unwrap().connector.config()["unit"], 1);
        assert!(manager.check_configuration_updates().await.unwrap().is_none());

        std::fs::write(&file, r#"{"unit": 2}"#).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        assert!(manager.check_configuration_updates().await.unwrap().is_some());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let reloaded = manager.get("a").unwrap();
        assert_eq!(reloaded.connector.config()["unit"], 2);
        assert!(reloaded.connector.is_connected());
        assert!(manager.check_configuration_updates().await.unwrap().is_none());
    }

    #[test]
    fn test_idle_thresholds() {
        let manager = manager(Arc::new(AtomicUsize::new(0)));
        let mut config = ConnectorConfig::new("a", "test");
        config.inactivity_timeout_secs = Some(60);
        manager.load_connectors(&[config, ConnectorConfig::new("b", "test")]);
        let thresholds = manager.idle_thresholds();
        assert_eq!(thresholds.len(), 1);
        assert_eq!(thresholds["a"], Duration::from_secs(60));
    }
}
