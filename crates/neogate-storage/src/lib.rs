//! NeoGate Storage Crate
//!
//! Persistence for the gateway:
//!
//! - **Event storage**: the durable FIFO between ingestion and delivery, with memory,
//!   file and redb backends behind the [`EventStorage`] trait
//! - **Gateway state**: the device directory snapshot and connector keys, in redb

pub mod backends;
pub mod error;
pub mod state;

pub use backends::{
    EventStorage, FileEventStorage, MemoryEventStorage, RedbEventStorage, create_event_storage,
};
pub use error::{Error, Result};
pub use state::{DeviceRecord, GatewayStateStore};
