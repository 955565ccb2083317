//! Remote reconfiguration.
//!
//! Each category is applied by building the replacement first and tearing the old object
//! down only once the replacement is healthy. A failed step leaves the previous object
//! live. Only one reconfiguration runs at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use neogate_core::{
    ConfigurationUpdate, ConnectorConfig, DownlinkSender, Error, GatewayConfig, Result,
    StorageConfig, UplinkConfig, UplinkFactory,
};
use neogate_storage::{EventStorage, create_event_storage};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::manager::ConnectorManager;
use crate::{PackGate, SharedStorage, SharedUplink};

const HEALTH_POLL: Duration = Duration::from_millis(100);

/// Copies one applied section from the live configuration into the on-disk one.
type MergeSection = fn(&mut GatewayConfig, &GatewayConfig);

/// Move every record from `old` into `new`, preserving order.
///
/// The old backend is drained first and the records land in `new` as one batch. If the
/// batch does not fit, everything is put back into `old` and the error is returned. A read
/// failure midway puts the drained records back behind the unread remainder.
pub fn migrate_events(old: &dyn EventStorage, new: &dyn EventStorage) -> Result<usize> {
    let mut records = Vec::with_capacity(old.len());
    loop {
        let drained = old.get_event_pack().and_then(|pack| {
            if !pack.is_empty() {
                old.event_pack_processing_done()?;
            }
            Ok(pack)
        });
        let pack = match drained {
            Ok(pack) => pack,
            Err(e) => {
                restore_events(old, &records);
                return Err(e.into());
            }
        };
        if pack.is_empty() {
            break;
        }
        records.extend(pack);
    }

    if let Err(e) = new.put_all(&records) {
        restore_events(old, &records);
        return Err(e.into());
    }
    Ok(records.len())
}

fn restore_events(old: &dyn EventStorage, records: &[Vec<u8>]) {
    if records.is_empty() {
        return;
    }
    match old.put_all(records) {
        Ok(()) => warn!(records = records.len(), "Migration aborted, records returned to the current backend"),
        Err(e) => error!(records = records.len(), error = %e, "Migration aborted and records could not be returned"),
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InProgress(flag))
            .map_err(|_| Error::Reconfiguration("already in progress".into()))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The live objects a reconfiguration may replace.
#[derive(Clone)]
pub struct ReconfigTargets {
    pub uplink: SharedUplink,
    pub storage: SharedStorage,
    pub gate: PackGate,
    pub connectors: Arc<ConnectorManager>,
}

pub struct Reconfigurator {
    config: Arc<Mutex<GatewayConfig>>,
    config_path: Option<PathBuf>,
    targets: ReconfigTargets,
    factory: Arc<dyn UplinkFactory>,
    downlink: DownlinkSender,
    in_progress: AtomicBool,
}

impl Reconfigurator {
    pub fn new(
        config: Arc<Mutex<GatewayConfig>>,
        config_path: Option<PathBuf>,
        targets: ReconfigTargets,
        factory: Arc<dyn UplinkFactory>,
        downlink: DownlinkSender,
    ) -> Self {
        Self {
            config,
            config_path,
            targets,
            factory,
            downlink,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Apply one configuration category. On error the previous configuration stays live.
    pub async fn apply(&self, update: ConfigurationUpdate) -> Result<()> {
        let _guard = InProgress::acquire(&self.in_progress).inspect_err(|_| {
            warn!(category = update.category(), "Reconfiguration rejected, another one is running");
        })?;
        let category = update.category();
        info!(category, "Applying new configuration");

        let merge: MergeSection = match &update {
            ConfigurationUpdate::Connection(_) => |disk, live| disk.uplink = live.uplink.clone(),
            ConfigurationUpdate::Storage(_) => |disk, live| disk.storage = live.storage.clone(),
            ConfigurationUpdate::Connectors(_) => {
                |disk, live| disk.connectors = live.connectors.clone()
            }
        };
        let applied = match update {
            ConfigurationUpdate::Connection(uplink) => self.apply_connection(uplink).await,
            ConfigurationUpdate::Storage(storage) => self.apply_storage(storage).await,
            ConfigurationUpdate::Connectors(connectors) => self.apply_connectors(connectors).await,
        };

        match &applied {
            Ok(()) => {
                info!(category, "Configuration applied");
                self.persist(merge);
            }
            Err(e) => error!(category, error = %e, "Configuration rolled back"),
        }
        applied
    }

    /// Reload connectors when the configuration files changed on disk and adopt the file's
    /// connector list. Returns whether a reload happened. Fails with `Reconfiguration` while
    /// a remote reconfiguration is running.
    pub async fn reload_from_file(&self) -> Result<bool> {
        let _guard = InProgress::acquire(&self.in_progress)?;
        match self.targets.connectors.check_configuration_updates().await? {
            Some(connectors) => {
                self.config.lock().connectors = connectors;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write the applied section into the configuration file, keeping the rest of the file
    /// as it is on disk.
    fn persist(&self, merge: MergeSection) {
        let Some(path) = &self.config_path else {
            return;
        };
        let connectors = &self.targets.connectors;
        let unseen_edits = connectors.has_file_changes();
        let live = self.config.lock().clone();
        let merged = match GatewayConfig::load(path) {
            Ok(mut disk) => {
                merge(&mut disk, &live);
                disk
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Configuration file unreadable, writing the live configuration");
                live
            }
        };
        if let Err(e) = merged.save(path) {
            error!(path = %path.display(), error = %e, "Failed to save configuration");
        }
        // Our own write is not an edit to reload; earlier edits still are.
        if !unseen_edits {
            connectors.refresh_stamps();
        }
    }

    async fn apply_connection(&self, uplink_config: UplinkConfig) -> Result<()> {
        uplink_config
            .validate()
            .map_err(|e| Error::Reconfiguration(e.to_string()))?;
        let candidate = self
            .factory
            .create(&uplink_config, self.downlink.clone())
            .map_err(|e| Error::Reconfiguration(format!("cannot build uplink: {}", e)))?;

        if let Err(e) = candidate.connect().await {
            candidate.disconnect().await;
            return Err(Error::Reconfiguration(format!("cannot connect: {}", e)));
        }

        let deadline = Instant::now() + uplink_config.connect_timeout();
        while !candidate.is_connected() {
            if Instant::now() >= deadline {
                candidate.disconnect().await;
                return Err(Error::Reconfiguration(format!(
                    "{} did not connect within {}s",
                    candidate.name(),
                    uplink_config.connect_timeout_secs
                )));
            }
            tokio::time::sleep(HEALTH_POLL).await;
        }

        let previous = {
            let _pack = self.targets.gate.lock().await;
            std::mem::replace(&mut *self.targets.uplink.write(), candidate)
        };
        previous.disconnect().await;
        self.config.lock().uplink = uplink_config;
        Ok(())
    }

    async fn apply_storage(&self, storage_config: StorageConfig) -> Result<()> {
        let candidate = create_event_storage(&storage_config)
            .map_err(|e| Error::Reconfiguration(format!("cannot build storage: {}", e)))?;

        let previous = {
            let _pack = self.targets.gate.lock().await;
            // Ingestion waits on the slot while records move, so none land in the old backend.
            let mut slot = self.targets.storage.write();
            match migrate_events(slot.as_ref(), candidate.as_ref()) {
                Ok(moved) => info!(moved, backend = candidate.kind(), "Queued records migrated"),
                Err(e) => {
                    drop(slot);
                    candidate.stop();
                    return Err(Error::Reconfiguration(format!("migration failed: {}", e)));
                }
            }
            std::mem::replace(&mut *slot, candidate)
        };
        previous.stop();
        self.config.lock().storage = storage_config;
        Ok(())
    }

    async fn apply_connectors(&self, connectors: Vec<ConnectorConfig>) -> Result<()> {
        let mut candidate_config = self.config.lock().clone();
        candidate_config.connectors = connectors.clone();
        candidate_config
            .validate()
            .map_err(|e| Error::Reconfiguration(e.to_string()))?;

        let manager = &self.targets.connectors;
        let set = manager.open_set(&connectors).await?;
        let previous = manager.replace_all(set, &connectors);
        manager.close_set(&previous).await;
        self.config.lock().connectors = connectors;
        Ok(())
    }
}

impl std::fmt::Debug for Reconfigurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconfigurator")
            .field("config_path", &self.config_path)
            .field("in_progress", &self.is_in_progress())
            .finish_non_exhaustive()
    }
}
