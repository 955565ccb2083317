//! Ingestion pipeline.
//!
//! The single intake every connector calls. In order: validation, device policy,
//! change detection, timestamp normalization, device registration, rename mapping,
//! oversize splitting and enqueue.

use std::sync::Arc;

use neogate_core::data::TelemetryValues;
use neogate_core::{
    ConnectorIdentity, ConvertedData, DedupFilter, DeviceFilter, IngestStatus, QueuedEvent,
    TelemetryEntry, now_millis, split_converted_data,
};
use tracing::{debug, error, warn};

use crate::SharedStorage;
use crate::directory::DeviceDirectory;
use crate::stats::{GatewayStats, bump};

/// Stamp every telemetry entry with an integer timestamp.
///
/// Entries without `ts`, or with a `ts` that is not an integer, are merged into one
/// entry stamped `now`, placed where the first of them was. If an entry already carries
/// `now` they merge into that one instead.
pub fn normalize_timestamps(data: &mut ConvertedData, now: i64) {
    let mut merged: Option<(usize, TelemetryValues)> = None;
    let mut kept = Vec::with_capacity(data.telemetry.len());

    for entry in std::mem::take(&mut data.telemetry) {
        if entry.millis().is_some() {
            kept.push(entry);
            continue;
        }
        if entry.has_invalid_ts() {
            warn!(
                device = %data.device_name,
                ts = ?entry.ts,
                "Invalid telemetry timestamp, using ingestion time"
            );
        }
        match &mut merged {
            Some((_, values)) => values.extend(entry.values),
            None => merged = Some((kept.len(), entry.values)),
        }
    }

    if let Some((position, values)) = merged
        && !values.is_empty()
    {
        match kept.iter_mut().find(|entry| entry.millis() == Some(now)) {
            Some(existing) => existing.values.extend(values),
            None => kept.insert(position, TelemetryEntry::with_ts(now, values)),
        }
    }
    kept.retain(|entry| !entry.values.is_empty());
    data.telemetry = kept;
}

pub struct IngestionPipeline {
    directory: Arc<DeviceDirectory>,
    storage: SharedStorage,
    dedup: Arc<DedupFilter>,
    dedup_all: bool,
    filter: DeviceFilter,
    max_payload: usize,
    stats: Arc<GatewayStats>,
}

impl IngestionPipeline {
    pub fn new(
        directory: Arc<DeviceDirectory>,
        storage: SharedStorage,
        dedup: Arc<DedupFilter>,
        filter: DeviceFilter,
        max_payload: usize,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            directory,
            storage,
            dedup,
            dedup_all: false,
            filter,
            max_payload,
            stats,
        }
    }

    /// Apply change detection to every connector, not only those asking for it.
    pub fn with_dedup_for_all(mut self, enabled: bool) -> Self {
        self.dedup_all = enabled;
        self
    }

    /// Ingest one record on behalf of `connector`.
    pub fn ingest(&self, connector: &ConnectorIdentity, mut data: ConvertedData) -> IngestStatus {
        if data.device_name.trim().is_empty() || data.is_empty() {
            bump(&self.stats.invalid);
            warn!(connector = %connector.name, device = %data.device_name, "Rejected invalid record");
            return IngestStatus::InvalidData;
        }

        if !self.filter.is_allowed(&connector.name, &data.device_name) {
            bump(&self.stats.forbidden);
            debug!(connector = %connector.name, device = %data.device_name, "Device forbidden by policy");
            return IngestStatus::ForbiddenDevice;
        }

        if (self.dedup_all || connector.send_data_only_on_change) && !self.dedup.filter(&mut data) {
            bump(&self.stats.no_new_data);
            return IngestStatus::NoNewData;
        }

        normalize_timestamps(&mut data, now_millis());

        if !self.directory.touch(&data.device_name) {
            self.directory
                .add_device(&data.device_name, connector, &data.device_type);
        }
        if let Some(cloud_name) = self.directory.cloud_name(&data.device_name) {
            data.device_name = cloud_name;
        }

        let device = data.device_name.clone();
        let parts = split_converted_data(data, self.max_payload);
        if parts.len() > 1 {
            debug!(connector = %connector.name, parts = parts.len(), "Split oversized record");
        }

        // All parts of a split record are queued together or not at all.
        let storage = self.storage.read().clone();
        let stored = parts
            .into_iter()
            .map(|part| QueuedEvent::new(connector.name.as_str(), connector.id.as_str(), part).to_bytes())
            .collect::<neogate_core::Result<Vec<_>>>()
            .and_then(|records| storage.put_all(&records).map_err(Into::into));
        if let Err(e) = stored {
            bump(&self.stats.storage_failures);
            error!(
                connector = %connector.name,
                device = %device,
                backend = storage.kind(),
                error = %e,
                "Failed to store record, dropping it"
            );
            return IngestStatus::Failure;
        }

        bump(&self.stats.ingested);
        self.stats.record_received(&connector.name);
        IngestStatus::Success
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("max_payload", &self.max_payload)
            .field("dedup_all", &self.dedup_all)
            .finish_non_exhaustive()
    }
}
