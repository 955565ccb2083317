//! NeoGate Core Crate
//!
//! Shared building blocks for the NeoGate protocol gateway.
//!
//! ## Architecture
//!
//! - **ConvertedData**: the common attribute/telemetry shape every connector produces
//! - **Connector**: protocol adapter interface plus a type-tag registry of constructors
//! - **Uplink**: the cloud link interface and its [`PublishHandle`] acknowledgments
//! - **DedupFilter** / **DeviceFilter**: per-key change detection and allow/deny policy
//! - **split**: oversize payload repacking
//!
//! Everything stateful and long-lived (queues, workers, the device directory) lives in
//! `neogate-storage` and `neogate-gateway`; this crate has no runtime of its own.

pub mod config;
pub mod connector;
pub mod data;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod rpc;
pub mod split;
pub mod uplink;

pub use config::{
    ConnectorConfig, DedupConfig, DeliveryConfig, DeviceFilterConfig, GatewayConfig, RpcConfig,
    StorageConfig, UplinkConfig,
};
pub use connector::{
    Connector, ConnectorContext, ConnectorIdentity, ConnectorRegistry, GatewaySink,
};
pub use data::{
    Attributes, ConvertedData, IngestStatus, QueuedEvent, TelemetryEntry, TelemetryPoint,
    TelemetryValues, now_millis,
};
pub use dedup::DedupFilter;
pub use error::{Error, Result};
pub use filter::DeviceFilter;
pub use rpc::{
    AttributeUpdate, ConfigurationUpdate, DownlinkMessage, RpcData, RpcReply, RpcRequest,
};
pub use split::split_converted_data;
pub use uplink::{
    DownlinkSender, PublishAck, PublishHandle, PublishResult, QoS, Uplink, UplinkFactory,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
