//! In-memory event storage.
//!
//! Bounded and fast, but not crash-durable: records still queued when the process dies
//! are lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::EventStorage;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct MemoryQueue {
    records: VecDeque<Vec<u8>>,
    /// Length of the outstanding pack at the head of `records`.
    pending: usize,
}

/// Bounded in-memory FIFO.
#[derive(Debug)]
pub struct MemoryEventStorage {
    queue: Mutex<MemoryQueue>,
    max_records: usize,
    read_records: usize,
    stopped: AtomicBool,
}

impl MemoryEventStorage {
    pub fn new(max_records: usize, read_records: usize) -> Self {
        Self {
            queue: Mutex::new(MemoryQueue::default()),
            max_records,
            read_records: read_records.max(1),
            stopped: AtomicBool::new(false),
        }
    }
}

impl EventStorage for MemoryEventStorage {
    fn put(&self, record: &[u8]) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut queue = self.queue.lock();
        if queue.records.len() >= self.max_records {
            return Err(Error::QueueFull);
        }
        queue.records.push_back(record.to_vec());
        Ok(())
    }

    fn put_all(&self, records: &[Vec<u8>]) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut queue = self.queue.lock();
        if queue.records.len() + records.len() > self.max_records {
            return Err(Error::QueueFull);
        }
        queue.records.extend(records.iter().cloned());
        Ok(())
    }

    fn get_event_pack(&self) -> Result<Vec<Vec<u8>>> {
        let mut queue = self.queue.lock();
        if queue.pending == 0 {
            queue.pending = queue.records.len().min(self.read_records);
        }
        Ok(queue.records.iter().take(queue.pending).cloned().collect())
    }

    fn event_pack_processing_done(&self) -> Result<()> {
        let mut queue = self.queue.lock();
        let done = queue.pending;
        queue.records.drain(..done);
        queue.pending = 0;
        Ok(())
    }

    fn len(&self) -> usize {
        self.queue.lock().records.len()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_packs() {
        let storage = MemoryEventStorage::new(100, 2);
        for i in 0..5u8 {
            storage.put(&[i]).unwrap();
        }
        assert_eq!(storage.get_event_pack().unwrap(), vec![vec![0], vec![1]]);
        storage.event_pack_processing_done().unwrap();
        assert_eq!(storage.get_event_pack().unwrap(), vec![vec![2], vec![3]]);
        storage.event_pack_processing_done().unwrap();
        assert_eq!(storage.get_event_pack().unwrap(), vec![vec![4]]);
        storage.event_pack_processing_done().unwrap();
        assert!(storage.is_empty());
        assert!(storage.get_event_pack().unwrap().is_empty());
    }

    #[test]
    fn test_unconfirmed_pack_is_repeated() {
        let storage = MemoryEventStorage::new(100, 2);
        storage.put(b"a").unwrap();
        let first = storage.get_event_pack().unwrap();
        storage.put(b"b").unwrap();
        // Records appended after the pack was cut do not join it.
        assert_eq!(storage.get_event_pack().unwrap(), first);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_capacity_and_stop() {
        let storage = MemoryEventStorage::new(1, 10);
        storage.put(b"a").unwrap();
        assert!(matches!(storage.put(b"b"), Err(Error::QueueFull)));
        storage.stop();
        storage.get_event_pack().unwrap();
        storage.event_pack_processing_done().unwrap();
        assert!(matches!(storage.put(b"c"), Err(Error::Closed)));
    }
}
