//! Device directory.
//!
//! Authoritative map of device name to owning connector. Keys are the names connectors
//! use; a cloud-side rename is kept as `renamed_to` so the connector never has to learn
//! the new name. Every mutation is written through to the [`GatewayStateStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use neogate_core::ConnectorIdentity;
use neogate_storage::{DeviceRecord, GatewayStateStore};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// One known device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub device_type: String,
    pub connector_name: String,
    pub connector_id: String,
    pub renamed_to: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl Device {
    /// Name used towards the cloud.
    pub fn cloud_name(&self) -> &str {
        self.renamed_to.as_deref().unwrap_or(&self.name)
    }

    fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            device_type: self.device_type.clone(),
            connector_name: self.connector_name.clone(),
            connector_id: self.connector_id.clone(),
            renamed_to: self.renamed_to.clone(),
        }
    }

    fn from_record(record: DeviceRecord, now: DateTime<Utc>) -> Self {
        Self {
            name: record.name,
            device_type: record.device_type,
            connector_name: record.connector_name,
            connector_id: record.connector_id,
            renamed_to: record.renamed_to,
            last_activity: now,
        }
    }
}

/// Directory change, forwarded to the cloud as connect/disconnect notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Added {
        name: String,
        cloud_name: String,
        device_type: String,
    },
    Removed {
        name: String,
        cloud_name: String,
    },
}

pub struct DeviceDirectory {
    devices: Mutex<HashMap<String, Device>>,
    store: Option<Arc<GatewayStateStore>>,
    events: Option<mpsc::UnboundedSender<DirectoryEvent>>,
}

impl DeviceDirectory {
    /// Directory without persistence, for tests and embedded use.
    pub fn in_memory() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            store: None,
            events: None,
        }
    }

    pub fn new(store: Arc<GatewayStateStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::in_memory()
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DirectoryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the in-memory map with the persisted snapshot.
    pub fn load(&self) -> neogate_core::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.load_devices()?;
        let now = Utc::now();
        let mut devices = self.devices.lock();
        devices.clear();
        for record in records {
            devices.insert(record.name.clone(), Device::from_record(record, now));
        }
        info!(count = devices.len(), "Loaded device directory");
        Ok(devices.len())
    }

    fn persist(&self, device: &Device) {
        if let Some(store) = &self.store
            && let Err(e) = store.save_device(&device.to_record())
        {
            error!(device = %device.name, error = %e, "Failed to persist device");
        }
    }

    fn unpersist(&self, name: &str) {
        if let Some(store) = &self.store
            && let Err(e) = store.delete_device(name)
        {
            error!(device = %name, error = %e, "Failed to delete persisted device");
        }
    }

    fn emit(&self, event: DirectoryEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Register `name` as owned by `connector`. Returns `true` when the device is new or
    /// changed owner or type.
    pub fn add_device(&self, name: &str, connector: &ConnectorIdentity, device_type: &str) -> bool {
        let mut devices = self.devices.lock();
        let now = Utc::now();

        if let Some(existing) = devices.get_mut(name) {
            existing.last_activity = now;
            if existing.connector_name == connector.name && existing.device_type == device_type {
                return false;
            }
            existing.connector_name = connector.name.clone();
            existing.connector_id = connector.id.clone();
            existing.device_type = device_type.to_string();
            let updated = existing.clone();
            self.persist(&updated);
            debug!(device = %name, connector = %connector.name, "Device binding updated");
            return true;
        }

        let device = Device {
            name: name.to_string(),
            device_type: device_type.to_string(),
            connector_name: connector.name.clone(),
            connector_id: connector.id.clone(),
            renamed_to: None,
            last_activity: now,
        };
        self.persist(&device);
        self.emit(DirectoryEvent::Added {
            name: device.name.clone(),
            cloud_name: device.cloud_name().to_string(),
            device_type: device.device_type.clone(),
        });
        devices.insert(name.to_string(), device);
        info!(device = %name, connector = %connector.name, device_type, "Device added");
        true
    }

    fn local_key(devices: &HashMap<String, Device>, name: &str) -> Option<String> {
        if devices.contains_key(name) {
            return Some(name.to_string());
        }
        devices
            .values()
            .find(|d| d.renamed_to.as_deref() == Some(name))
            .map(|d| d.name.clone())
    }

    /// Remove a device by its local or cloud-side name.
    pub fn del_device(&self, name: &str) -> Option<Device> {
        let mut devices = self.devices.lock();
        let key = Self::local_key(&devices, name)?;
        let device = devices.remove(&key)?;
        self.unpersist(&device.name);
        self.emit(DirectoryEvent::Removed {
            name: device.name.clone(),
            cloud_name: device.cloud_name().to_string(),
        });
        info!(device = %device.name, cloud_name = %device.cloud_name(), "Device removed");
        Some(device)
    }

    pub fn get(&self, name: &str) -> Option<Device> {
        self.devices.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.lock().contains_key(name)
    }

    /// Owning connector `(name, id)`.
    pub fn owner(&self, name: &str) -> Option<(String, String)> {
        self.devices
            .lock()
            .get(name)
            .map(|d| (d.connector_name.clone(), d.connector_id.clone()))
    }

    /// Refresh the activity stamp. Returns `false` for unknown devices.
    pub fn touch(&self, name: &str) -> bool {
        match self.devices.lock().get_mut(name) {
            Some(device) => {
                device.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Cloud-side name of a local device.
    pub fn cloud_name(&self, name: &str) -> Option<String> {
        self.devices.lock().get(name).map(|d| d.cloud_name().to_string())
    }

    /// Find a device by the name the cloud knows it under.
    pub fn resolve(&self, cloud_name: &str) -> Option<Device> {
        let devices = self.devices.lock();
        if let Some(device) = devices
            .values()
            .find(|d| d.renamed_to.as_deref() == Some(cloud_name))
        {
            return Some(device.clone());
        }
        devices
            .get(cloud_name)
            .filter(|d| d.renamed_to.is_none())
            .cloned()
    }

    /// Record a cloud-side rename from `old_name` to `new_name`.
    pub fn rename(&self, old_name: &str, new_name: &str) -> bool {
        let mut devices = self.devices.lock();
        let key = devices
            .values()
            .find(|d| d.cloud_name() == old_name)
            .map(|d| d.name.clone());
        let Some(device) = key.and_then(|k| devices.get_mut(&k)) else {
            return false;
        };
        device.renamed_to = (device.name != new_name).then(|| new_name.to_string());
        let updated = device.clone();
        self.persist(&updated);
        info!(device = %updated.name, old_name, new_name, "Device renamed");
        true
    }

    pub fn devices_of(&self, connector_name: &str) -> Vec<Device> {
        self.devices
            .lock()
            .values()
            .filter(|d| d.connector_name == connector_name)
            .cloned()
            .collect()
    }

    /// Devices whose owner has an inactivity threshold they have exceeded.
    pub fn idle_devices(&self, now: DateTime<Utc>, thresholds: &HashMap<String, Duration>) -> Vec<Device> {
        self.devices
            .lock()
            .values()
            .filter(|d| {
                thresholds.get(&d.connector_name).is_some_and(|limit| {
                    (now - d.last_activity)
                        .to_std()
                        .is_ok_and(|idle| idle > *limit)
                })
            })
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DeviceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDirectory")
            .field("devices", &self.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modbus() -> ConnectorIdentity {
        ConnectorIdentity::new("modbus", "id-1", "modbus")
    }

    #[test]
    fn test_add_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let directory = DeviceDirectory::in_memory().with_events(tx);
        assert!(directory.add_device("d1", &modbus(), "meter"));
        assert!(!directory.add_device("d1", &modbus(), "meter"));
        assert_eq!(directory.len(), 1);
        assert!(matches!(rx.try_recv(), Ok(DirectoryEvent::Added { .. })));
        assert!(rx.try_recv().is_err());

        let other = ConnectorIdentity::new("bacnet", "id-2", "bacnet");
        assert!(directory.add_device("d1", &other, "meter"));
        assert_eq!(directory.owner("d1"), Some(("bacnet".into(), "id-2".into())));
    }

    #[test]
    fn test_rename_and_resolve() {
        let directory = DeviceDirectory::in_memory();
        directory.add_device("d1", &modbus(), "meter");
        assert!(directory.rename("d1", "d2"));
        assert_eq!(directory.cloud_name("d1").as_deref(), Some("d2"));
        assert_eq!(directory.resolve("d2").map(|d| d.name), Some("d1".to_string()));
        assert!(directory.resolve("d1").is_none());

        // Renaming back clears the alias.
        assert!(directory.rename("d2", "d1"));
        assert_eq!(directory.get("d1").unwrap().renamed_to, None);
        assert!(!directory.rename("ghost", "x"));
    }

    #[test]
    fn test_delete_by_cloud_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let directory = DeviceDirectory::in_memory().with_events(tx);
        directory.add_device("d1", &modbus(), "meter");
        directory.rename("d1", "d2");
        let removed = directory.del_device("d2").unwrap();
        assert_eq!(removed.name, "d1");
        assert!(directory.is_empty());
        let _added = rx.try_recv();
        assert_eq!(
            rx.try_recv().unwrap(),
            DirectoryEvent::Removed {
                name: "d1".into(),
                cloud_name: "d2".into()
            }
        );
    }

    #[test]
    fn test_idle_devices() {
        let directory = DeviceDirectory::in_memory();
        directory.add_device("d1", &modbus(), "meter");
        directory.add_device("d2", &ConnectorIdentity::new("ble", "id-3", "ble"), "tag");

        let mut thresholds = HashMap::new();
        thresholds.insert("modbus".to_string(), Duration::from_secs(60));
        let later = Utc::now() + chrono::Duration::seconds(120);
        let idle = directory.idle_devices(later, &thresholds);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].name, "d1");
        assert!(directory.idle_devices(Utc::now(), &thresholds).is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatewayStateStore::open(dir.path().join("state.redb")).unwrap());
        {
            let directory = DeviceDirectory::new(store.clone());
            directory.add_device("d1", &modbus(), "meter");
            directory.add_device("d3", &modbus(), "pump");
            directory.del_device("d3");
        }
        let directory = DeviceDirectory::new(store);
        assert_eq!(directory.load().unwrap(), 1);
        let device = directory.get("d1").unwrap();
        assert_eq!(device.device_type, "meter");
        assert_eq!(device.connector_name, "modbus");
        assert_eq!(device.connector_id, "id-1");
    }
}
