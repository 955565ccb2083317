//! Persisted gateway state using redb.
//!
//! Holds the device directory snapshot and the connector key map so both survive restarts.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::Error;

// Devices table: key = local device name, value = DeviceRecord (JSON)
const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("devices");

// Connector keys table: key = connector name, value = generated key
const CONNECTOR_KEYS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("connector_keys");

/// Persisted form of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub name: String,
    pub device_type: String,
    pub connector_name: String,
    pub connector_id: String,
    /// Cloud-side name after a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
}

/// Gateway state database.
pub struct GatewayStateStore {
    db: Database,
}

impl GatewayStateStore {
    /// Open or create the state database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _devices = write_txn.open_table(DEVICES_TABLE)?;
            let _keys = write_txn.open_table(CONNECTOR_KEYS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // ========== Devices ==========

    /// Insert or replace a device.
    pub fn save_device(&self, record: &DeviceRecord) -> Result<(), Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEVICES_TABLE)?;
            let json = serde_json::to_string(record)?;
            table.insert(record.name.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete a device. Returns whether it existed.
    pub fn delete_device(&self, name: &str) -> Result<bool, Error> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(DEVICES_TABLE)?;
            table.remove(name)?.is_some()
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// All persisted devices. Unreadable entries are skipped.
    pub fn load_devices(&self) -> Result<Vec<DeviceRecord>, Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;

        let mut devices = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            match serde_json::from_str::<DeviceRecord>(value.value()) {
                Ok(record) => devices.push(record),
                Err(e) => tracing::warn!(device = key.value(), error = %e, "Skipping unreadable device record"),
            }
        }
        Ok(devices)
    }

    /// Replace the whole device snapshot in one transaction.
    pub fn replace_devices(&self, records: &[DeviceRecord]) -> Result<(), Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEVICES_TABLE)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                stale.push(key.value().to_string());
            }
            for name in &stale {
                table.remove(name.as_str())?;
            }
            for record in records {
                let json = serde_json::to_string(record)?;
                table.insert(record.name.as_str(), json.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ========== Connector keys ==========

    /// Stable key for a connector, generated and persisted on first use.
    pub fn connector_key(&self, connector_name: &str) -> Result<String, Error> {
        {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(CONNECTOR_KEYS_TABLE)?;
            if let Some(value) = table.get(connector_name)? {
                return Ok(value.value().to_string());
            }
        }

        let key = uuid::Uuid::new_v4().to_string();
        let write_txn = self.db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(CONNECTOR_KEYS_TABLE)?;
            // Another caller may have raced us between the two transactions.
            let existing = table.get(connector_name)?.map(|v| v.value().to_string());
            match existing {
                Some(existing) => existing,
                None => {
                    table.insert(connector_name, key.as_str())?;
                    key
                }
            }
        };
        write_txn.commit()?;
        Ok(stored)
    }

    pub fn remove_connector_key(&self, connector_name: &str) -> Result<bool, Error> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(CONNECTOR_KEYS_TABLE)?;
            table.remove(connector_name)?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

impl std::fmt::Debug for GatewayStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayStateStore").finish_non_exhaustive()
    }
}
