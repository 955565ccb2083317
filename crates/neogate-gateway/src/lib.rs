//! NeoGate Gateway Crate
//!
//! The orchestration core of the protocol gateway.
//!
//! ## Architecture
//!
//! ```text
//! connectors ──► IngestionPipeline ──► EventStorage ──► DeliveryEngine ──► Uplink
//!     ▲               │                                                     │
//!     │          DeviceDirectory ◄── RpcRouter ◄── downlink ◄───────────────┘
//!     └───────────── ConnectorManager
//! ```
//!
//! - **directory**: device name → owning connector, with rename tracking, persisted
//! - **ingestion**: the single intake every connector calls
//! - **delivery**: drains the event storage in packs and confirms them after acks
//! - **rpc**: in-flight request correlation with timeouts, command routing
//! - **manager**: connector lifecycle and configuration hot reload
//! - **reconfig**: build-then-swap remote reconfiguration with rollback
//! - **gateway**: the service that owns all of the above and runs the workers

use std::sync::Arc;

use neogate_core::Uplink;
use neogate_storage::EventStorage;

pub mod delivery;
pub mod directory;
pub mod gateway;
pub mod ingestion;
pub mod manager;
pub mod reconfig;
pub mod rpc;
pub mod stats;
pub mod uplink;

pub use delivery::{DeliveryEngine, PackOutcome, Publish, batch_events};
pub use directory::{Device, DeviceDirectory, DirectoryEvent};
pub use gateway::{CoreSink, Gateway};
pub use ingestion::{IngestionPipeline, normalize_timestamps};
pub use manager::{ConnectorManager, ConnectorStatus, ManagedConnector};
pub use reconfig::{ReconfigTargets, Reconfigurator, migrate_events};
pub use rpc::{OutboundMessage, RpcCorrelation, RpcRouter};
pub use stats::{ConnectorStatsSnapshot, GatewayStats, StatsSnapshot};

#[cfg(feature = "mqtt")]
pub use uplink::mqtt::{MqttUplink, MqttUplinkFactory};

/// Event storage slot. Swapped in place by storage reconfiguration.
pub type SharedStorage = Arc<parking_lot::RwLock<Arc<dyn EventStorage>>>;

/// Uplink slot. Swapped in place by connection reconfiguration.
pub type SharedUplink = Arc<parking_lot::RwLock<Arc<dyn Uplink>>>;

/// Held by the delivery engine for the duration of a pack, so a reconfiguration can
/// wait for a pack boundary.
pub type PackGate = Arc<tokio::sync::Mutex<()>>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
