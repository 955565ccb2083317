//! Event storage backends.
//!
//! Every backend is a FIFO of opaque records consumed in packs. A pack is returned by
//! [`EventStorage::get_event_pack`] and stays the current pack (returned again on every
//! call) until [`EventStorage::event_pack_processing_done`] confirms it. Only then are
//! its records removed. Durable backends persist the read cursor, so a restart between
//! the two calls yields the same pack again.

use std::sync::Arc;

use neogate_core::StorageConfig;

use crate::error::Result;

pub mod file;
pub mod memory;
pub mod redb;

pub use self::file::FileEventStorage;
pub use self::memory::MemoryEventStorage;
pub use self::redb::RedbEventStorage;

/// Durable FIFO of serialized records.
///
/// Implementations own their locking; every method may be called from any thread.
pub trait EventStorage: Send + Sync {
    /// Append one record. Fails with `QueueFull` when the backend is at capacity.
    fn put(&self, record: &[u8]) -> Result<()>;

    /// Append several records as a unit: either all of them are queued, in order, or
    /// none is. Fails with `QueueFull` when they do not fit together.
    fn put_all(&self, records: &[Vec<u8>]) -> Result<()>;

    /// Current unconfirmed pack, or the next one if none is outstanding.
    fn get_event_pack(&self) -> Result<Vec<Vec<u8>>>;

    /// Confirm the current pack and advance the read cursor past it.
    fn event_pack_processing_done(&self) -> Result<()>;

    /// Records not yet confirmed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting records. Pending data stays where it is.
    fn stop(&self);

    /// Backend name for logs and statistics.
    fn kind(&self) -> &'static str;
}

/// Build the backend selected by `config`.
pub fn create_event_storage(config: &StorageConfig) -> Result<Arc<dyn EventStorage>> {
    let storage: Arc<dyn EventStorage> = match config {
        StorageConfig::Memory {
            max_records_count,
            read_records_count,
        } => Arc::new(MemoryEventStorage::new(*max_records_count, *read_records_count)),
        StorageConfig::File {
            data_folder,
            max_file_count,
            max_records_per_file,
            read_records_count,
        } => Arc::new(FileEventStorage::open(
            data_folder,
            *max_file_count,
            *max_records_per_file,
            *read_records_count,
        )?),
        StorageConfig::Redb {
            path,
            max_records_count,
            read_records_count,
        } => Arc::new(RedbEventStorage::open(
            path,
            *max_records_count,
            *read_records_count,
        )?),
    };
    tracing::info!(
        backend = storage.kind(),
        pending = storage.len(),
        "Event storage ready"
    );
    Ok(storage)
}
