//! Gateway counters.
//!
//! Lock-free counters for the pipeline plus a per-connector map. Formatting and export
//! are left to callers; [`GatewayStats::snapshot`] returns a serializable view.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Per-connector counters.
#[derive(Debug, Default)]
pub struct ConnectorStats {
    received: AtomicU64,
    errors: AtomicU64,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl ConnectorStats {
    fn snapshot(&self, name: &str) -> ConnectorStatsSnapshot {
        ConnectorStatsSnapshot {
            name: name.to_string(),
            connected: self.connected.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Serializable view of one connector's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorStatsSnapshot {
    pub name: String,
    pub connected: bool,
    pub received: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Serializable view of all counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub ingested: u64,
    pub no_new_data: u64,
    pub forbidden: u64,
    pub invalid: u64,
    pub storage_failures: u64,
    pub packs_delivered: u64,
    pub records_delivered: u64,
    pub undecodable_records: u64,
    pub publish_failures: u64,
    pub rpc_replies: u64,
    pub rpc_timeouts: u64,
    pub queue_size: usize,
    pub connectors: Vec<ConnectorStatsSnapshot>,
}

#[derive(Debug, Default)]
pub struct GatewayStats {
    pub ingested: AtomicU64,
    pub no_new_data: AtomicU64,
    pub forbidden: AtomicU64,
    pub invalid: AtomicU64,
    pub storage_failures: AtomicU64,
    pub packs_delivered: AtomicU64,
    pub records_delivered: AtomicU64,
    pub undecodable_records: AtomicU64,
    pub publish_failures: AtomicU64,
    pub rpc_replies: AtomicU64,
    pub rpc_timeouts: AtomicU64,
    connectors: DashMap<String, ConnectorStats>,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, connector: &str) {
        bump(&self.connectors.entry(connector.to_string()).or_default().received);
    }

    pub fn record_error(&self, connector: &str, error: impl ToString) {
        let entry = self.connectors.entry(connector.to_string()).or_default();
        bump(&entry.errors);
        *entry.last_error.lock() = Some(error.to_string());
    }

    pub fn set_connected(&self, connector: &str, connected: bool) {
        self.connectors
            .entry(connector.to_string())
            .or_default()
            .connected
            .store(connected, Ordering::Relaxed);
    }

    pub fn remove_connector(&self, connector: &str) {
        self.connectors.remove(connector);
    }

    pub fn connector(&self, name: &str) -> Option<ConnectorStatsSnapshot> {
        self.connectors.get(name).map(|entry| entry.snapshot(name))
    }

    pub fn snapshot(&self, queue_size: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut connectors: Vec<ConnectorStatsSnapshot> = self
            .connectors
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        connectors.sort_by(|a, b| a.name.cmp(&b.name));

        StatsSnapshot {
            ingested: load(&self.ingested),
            no_new_data: load(&self.no_new_data),
            forbidden: load(&self.forbidden),
            invalid: load(&self.invalid),
            storage_failures: load(&self.storage_failures),
            packs_delivered: load(&self.packs_delivered),
            records_delivered: load(&self.records_delivered),
            undecodable_records: load(&self.undecodable_records),
            publish_failures: load(&self.publish_failures),
            rpc_replies: load(&self.rpc_replies),
            rpc_timeouts: load(&self.rpc_timeouts),
            queue_size,
            connectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_counters() {
        let stats = GatewayStats::new();
        stats.record_received("modbus");
        stats.record_received("modbus");
        stats.set_connected("modbus", true);
        stats.record_error("modbus", "timeout reading register 40001");

        let snapshot = stats.connector("modbus").unwrap();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.errors, 1);
        assert!(snapshot.connected);
        assert_eq!(snapshot.last_error.as_deref(), Some("timeout reading register 40001"));
    }

    #[test]
    fn test_snapshot_includes_queue_size() {
        let stats = GatewayStats::new();
        bump(&stats.ingested);
        stats.set_connected("b", false);
        stats.set_connected("a", true);
        let snapshot = stats.snapshot(42);
        assert_eq!(snapshot.ingested, 1);
        assert_eq!(snapshot.queue_size, 42);
        let names: Vec<_> = snapshot.connectors.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(serde_json::to_value(&snapshot).is_ok());
    }
}
