//! Event storage in an embedded redb table.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use super::EventStorage;
use crate::error::{Error, Result};

// Events table: key = sequence number, value = record bytes
const EVENTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

// Meta table: key = name, value = counter
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("events_meta");

const NEXT_SEQ_KEY: &str = "next_seq";

#[derive(Debug)]
struct Pending {
    keys: Vec<u64>,
    records: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct RedbQueue {
    count: usize,
    pending: Option<Pending>,
}

/// Sequence-keyed redb table.
pub struct RedbEventStorage {
    db: Database,
    max_records: usize,
    read_records: usize,
    queue: Mutex<RedbQueue>,
    stopped: AtomicBool,
}

impl RedbEventStorage {
    pub fn open(path: impl AsRef<Path>, max_records: usize, read_records: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _events = write_txn.open_table(EVENTS_TABLE)?;
            let _meta = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        let count = {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(EVENTS_TABLE)?;
            table.len()? as usize
        };
        debug!(path = %path.display(), count, "Opened redb event storage");

        Ok(Self {
            db,
            max_records,
            read_records: read_records.max(1),
            queue: Mutex::new(RedbQueue {
                count,
                pending: None,
            }),
            stopped: AtomicBool::new(false),
        })
    }
}

impl RedbEventStorage {
    /// Insert `records` in one write transaction, so a batch lands completely or not at all.
    fn append<'a, I>(&self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: ExactSizeIterator,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let records = records.into_iter();
        let added = records.len();
        let mut queue = self.queue.lock();
        if queue.count + added > self.max_records {
            return Err(Error::QueueFull);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let mut seq = meta.get(NEXT_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            for record in records {
                events.insert(seq, record)?;
                seq += 1;
            }
            meta.insert(NEXT_SEQ_KEY, seq)?;
        }
        write_txn.commit()?;

        queue.count += added;
        Ok(())
    }
}

impl EventStorage for RedbEventStorage {
    fn put(&self, record: &[u8]) -> Result<()> {
        self.append(std::iter::once(record))
    }

    fn put_all(&self, records: &[Vec<u8>]) -> Result<()> {
        self.append(records.iter().map(Vec::as_slice))
    }

    fn get_event_pack(&self) -> Result<Vec<Vec<u8>>> {
        let mut queue = self.queue.lock();
        if let Some(pending) = &queue.pending {
            return Ok(pending.records.clone());
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EVENTS_TABLE)?;
        let mut keys = Vec::new();
        let mut records = Vec::new();
        for entry in table.iter()?.take(self.read_records) {
            let (key, value) = entry?;
            keys.push(key.value());
            records.push(value.value().to_vec());
        }

        if !keys.is_empty() {
            queue.pending = Some(Pending {
                keys,
                records: records.clone(),
            });
        }
        Ok(records)
    }

    fn event_pack_processing_done(&self) -> Result<()> {
        let mut queue = self.queue.lock();
        let Some(pending) = queue.pending.take() else {
            return Ok(());
        };

        let remove = || -> Result<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(EVENTS_TABLE)?;
                for key in &pending.keys {
                    table.remove(*key)?;
                }
            }
            write_txn.commit()?;
            Ok(())
        };

        match remove() {
            Ok(()) => {
                queue.count = queue.count.saturating_sub(pending.keys.len());
                Ok(())
            }
            Err(e) => {
                // Keep the pack outstanding so the next attempt confirms the same keys.
                queue.pending = Some(pending);
                Err(e)
            }
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().count
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn kind(&self) -> &'static str {
        "redb"
    }
}

impl std::fmt::Debug for RedbEventStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbEventStorage")
            .field("max_records", &self.max_records)
            .field("read_records", &self.read_records)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbEventStorage::open(dir.path().join("q.redb"), 3, 2).unwrap();
        storage.put(b"a").unwrap();
        storage.put(b"b").unwrap();
        storage.put(b"c").unwrap();
        assert!(matches!(storage.put(b"d"), Err(Error::QueueFull)));

        assert_eq!(storage.get_event_pack().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        storage.event_pack_processing_done().unwrap();
        assert_eq!(storage.len(), 1);
        storage.put(b"d").unwrap();
        assert_eq!(storage.get_event_pack().unwrap(), vec![b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_sequence_continues_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.redb");
        {
            let storage = RedbEventStorage::open(&path, 10, 10).unwrap();
            storage.put(b"a").unwrap();
            storage.get_event_pack().unwrap();
            storage.event_pack_processing_done().unwrap();
            storage.put(b"b").unwrap();
        }
        let storage = RedbEventStorage::open(&path, 10, 10).unwrap();
        storage.put(b"c").unwrap();
        assert_eq!(storage.get_event_pack().unwrap(), vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
