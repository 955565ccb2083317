//! Connector trait and registry.
//!
//! A connector bridges one wire protocol to [`ConvertedData`]. Connectors never share
//! mutable state with the gateway; they talk to it only through the [`ConnectorContext`]
//! injected at construction.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut registry = ConnectorRegistry::new();
//! registry.register("modbus", |config, ctx| {
//!     Ok(Arc::new(ModbusConnector::new(config, ctx)?) as Arc<dyn Connector>)
//! });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConnectorConfig;
use crate::data::{ConvertedData, IngestStatus};
use crate::error::{Error, Result};
use crate::rpc::{AttributeUpdate, RpcReply, RpcRequest};

/// Protocol connector capability set.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Connector type tag, as registered.
    fn connector_type(&self) -> &str;

    /// Connector-specific configuration.
    fn config(&self) -> &Value;

    fn is_connected(&self) -> bool;

    /// Start the connector's own I/O.
    async fn open(&self) -> Result<()>;

    /// Stop the connector. Must be idempotent and safe to call while the connector is
    /// still pushing data.
    async fn close(&self);

    async fn on_attributes_update(&self, update: AttributeUpdate) -> Result<()>;

    /// Handle a command. The reply travels back through
    /// [`ConnectorContext::send_rpc_reply`].
    async fn server_side_rpc_handler(&self, request: RpcRequest) -> Result<()>;
}

/// Identity the gateway attaches to every call a connector makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorIdentity {
    pub name: String,
    pub id: String,
    pub connector_type: String,
    pub send_data_only_on_change: bool,
}

impl ConnectorIdentity {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        connector_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            connector_type: connector_type.into(),
            send_data_only_on_change: false,
        }
    }

    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.send_data_only_on_change = enabled;
        self
    }
}

/// Entry points of the gateway available to connectors.
pub trait GatewaySink: Send + Sync {
    /// Ingest one record. Never blocks indefinitely.
    fn send_to_storage(&self, connector: &ConnectorIdentity, data: ConvertedData) -> IngestStatus;

    /// Reply to a command previously handed to the connector.
    fn send_rpc_reply(&self, connector: &ConnectorIdentity, reply: RpcReply);

    /// Register a device as owned by the connector.
    fn add_device(&self, connector: &ConnectorIdentity, device_name: &str, device_type: &str);

    /// Remove a device.
    fn del_device(&self, connector: &ConnectorIdentity, device_name: &str);
}

/// Per-instance handle injected into each connector.
#[derive(Clone)]
pub struct ConnectorContext {
    identity: ConnectorIdentity,
    sink: Arc<dyn GatewaySink>,
}

impl ConnectorContext {
    pub fn new(identity: ConnectorIdentity, sink: Arc<dyn GatewaySink>) -> Self {
        Self { identity, sink }
    }

    pub fn identity(&self) -> &ConnectorIdentity {
        &self.identity
    }

    pub fn send_to_storage(&self, data: ConvertedData) -> IngestStatus {
        self.sink.send_to_storage(&self.identity, data)
    }

    pub fn send_rpc_reply(&self, device: Option<String>, request_id: u64, payload: Value) {
        self.sink
            .send_rpc_reply(&self.identity, RpcReply::success(device, request_id, payload));
    }

    pub fn add_device(&self, device_name: &str, device_type: &str) {
        self.sink.add_device(&self.identity, device_name, device_type);
    }

    pub fn del_device(&self, device_name: &str) {
        self.sink.del_device(&self.identity, device_name);
    }
}

impl std::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Constructor stored in the registry.
pub type ConnectorConstructor =
    dyn Fn(ConnectorConfig, ConnectorContext) -> Result<Arc<dyn Connector>> + Send + Sync;

/// Type tag → constructor map, resolved at configuration-load time.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    constructors: HashMap<String, Arc<ConnectorConstructor>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `connector_type`, replacing any previous one.
    pub fn register<F>(&mut self, connector_type: impl Into<String>, constructor: F)
    where
        F: Fn(ConnectorConfig, ConnectorContext) -> Result<Arc<dyn Connector>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(connector_type.into(), Arc::new(constructor));
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.constructors.contains_key(connector_type)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Instantiate a connector.
    pub fn create(
        &self,
        config: ConnectorConfig,
        context: ConnectorContext,
    ) -> Result<Arc<dyn Connector>> {
        let constructor = self.constructors.get(&config.connector_type).ok_or_else(|| {
            Error::Config(format!(
                "unknown connector type '{}' for connector '{}'",
                config.connector_type, config.name
            ))
        })?;
        constructor(config, context)
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("types", &self.types())
            .finish()
    }
}
