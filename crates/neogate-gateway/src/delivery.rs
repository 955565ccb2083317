//! Delivery engine.
//!
//! Drains the event storage one pack at a time. Records of a pack are grouped per device
//! (attributes merged, telemetry concatenated in order), published over the uplink, and
//! the pack is confirmed only after every publish handle resolves successfully.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use neogate_core::{
    Attributes, DeliveryConfig, PublishHandle, PublishResult, QoS, QueuedEvent, TelemetryPoint,
    Uplink,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stats::{GatewayStats, bump};
use crate::{PackGate, SharedStorage, SharedUplink};

const LINK_RETRY_CAP: Duration = Duration::from_secs(30);

// Brackets around a JSON object or array.
const ENCLOSING: usize = 2;

/// Result of one [`DeliveryEngine::process_pack`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackOutcome {
    /// Nothing queued.
    Empty,
    /// Pack below the minimum size, held back for the send-delay window.
    Deferred,
    /// Every publish acknowledged and the pack confirmed.
    Delivered { records: usize, publishes: usize },
    /// Link down or a publish failed; the pack stays queued.
    Aborted,
}

/// One uplink call.
#[derive(Debug, Clone, PartialEq)]
pub enum Publish {
    Attributes { device: String, attributes: Attributes },
    Telemetry { device: String, points: Vec<TelemetryPoint> },
}

fn json_len(value: &impl serde::Serialize) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn key_cost(key: &str, value: &Value) -> usize {
    key.len() + json_len(value) + 4
}

#[derive(Debug)]
struct DeviceBatch {
    device: String,
    attributes: Attributes,
    attributes_size: usize,
    points: Vec<TelemetryPoint>,
    points_size: usize,
}

/// Per-device accumulation with size-bounded flushing.
#[derive(Debug)]
struct Batcher {
    max_payload: usize,
    order: Vec<DeviceBatch>,
    index: HashMap<String, usize>,
    out: Vec<Publish>,
}

impl Batcher {
    fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            order: Vec::new(),
            index: HashMap::new(),
            out: Vec::new(),
        }
    }

    fn batch(&mut self, device: &str) -> &mut DeviceBatch {
        let next = self.order.len();
        let slot = *self.index.entry(device.to_string()).or_insert(next);
        if slot == next {
            self.order.push(DeviceBatch {
                device: device.to_string(),
                attributes: Attributes::new(),
                attributes_size: 0,
                points: Vec::new(),
                points_size: 0,
            });
        }
        &mut self.order[slot]
    }

    fn add(&mut self, event: QueuedEvent) {
        let max = self.max_payload;
        let device = event.data.device_name.clone();
        let fallback_ts = event.enqueued_at;
        let mut flushed = Vec::new();
        let batch = self.batch(&device);

        for (key, value) in event.data.attributes {
            let cost = key_cost(&key, &value);
            if batch.attributes_size + cost + ENCLOSING > max && !batch.attributes.is_empty() {
                flushed.push(Publish::Attributes {
                    device: device.clone(),
                    attributes: std::mem::take(&mut batch.attributes),
                });
                batch.attributes_size = 0;
            }
            batch.attributes_size += cost;
            batch.attributes.insert(key, value);
        }

        for entry in event.data.telemetry {
            if entry.values.is_empty() {
                continue;
            }
            let point = TelemetryPoint::new(entry.millis().unwrap_or(fallback_ts), entry.values);
            let cost = json_len(&point) + 1;
            if batch.points_size + cost + ENCLOSING > max && !batch.points.is_empty() {
                flushed.push(Publish::Telemetry {
                    device: device.clone(),
                    points: std::mem::take(&mut batch.points),
                });
                batch.points_size = 0;
            }
            batch.points_size += cost;
            batch.points.push(point);
        }

        self.out.extend(flushed);
    }

    fn finish(mut self) -> Vec<Publish> {
        for batch in self.order {
            if !batch.attributes.is_empty() {
                self.out.push(Publish::Attributes {
                    device: batch.device.clone(),
                    attributes: batch.attributes,
                });
            }
            if !batch.points.is_empty() {
                self.out.push(Publish::Telemetry {
                    device: batch.device,
                    points: batch.points,
                });
            }
        }
        self.out
    }
}

/// Group decoded records into uplink calls bounded by `max_payload`.
pub fn batch_events(events: Vec<QueuedEvent>, max_payload: usize) -> Vec<Publish> {
    let mut batcher = Batcher::new(max_payload);
    for event in events {
        batcher.add(event);
    }
    batcher.finish()
}

pub struct DeliveryEngine {
    storage: SharedStorage,
    uplink: SharedUplink,
    gate: PackGate,
    config: DeliveryConfig,
    qos: QoS,
    stats: Arc<GatewayStats>,
    deferred_since: Mutex<Option<Instant>>,
}

impl DeliveryEngine {
    pub fn new(
        storage: SharedStorage,
        uplink: SharedUplink,
        gate: PackGate,
        config: DeliveryConfig,
        qos: QoS,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            storage,
            uplink,
            gate,
            config,
            qos,
            stats,
            deferred_since: Mutex::new(None),
        }
    }

    fn should_defer(&self, pack_len: usize) -> bool {
        if pack_len >= self.config.min_pack_size_to_send {
            *self.deferred_since.lock() = None;
            return false;
        }
        let mut since = self.deferred_since.lock();
        match *since {
            None => {
                *since = Some(Instant::now());
                true
            }
            Some(start) if start.elapsed() < self.config.min_pack_send_delay() => true,
            Some(_) => {
                *since = None;
                false
            }
        }
    }

    async fn send(&self, uplink: &Arc<dyn Uplink>, publish: &Publish) -> PublishHandle {
        match publish {
            Publish::Attributes { device, attributes } => {
                uplink.send_attributes(device, attributes, self.qos).await
            }
            Publish::Telemetry { device, points } => {
                uplink.send_telemetry(device, points, self.qos).await
            }
        }
    }

    /// Deliver at most one pack.
    pub async fn process_pack(&self) -> neogate_core::Result<PackOutcome> {
        let _gate = self.gate.lock().await;

        let uplink = self.uplink.read().clone();
        if !uplink.is_connected() {
            return Ok(PackOutcome::Aborted);
        }

        let storage = self.storage.read().clone();
        let pack = storage.get_event_pack()?;
        if pack.is_empty() {
            return Ok(PackOutcome::Empty);
        }
        if self.should_defer(pack.len()) {
            return Ok(PackOutcome::Deferred);
        }

        let records = pack.len();
        let mut events = Vec::with_capacity(records);
        for bytes in &pack {
            match QueuedEvent::from_bytes(bytes) {
                Ok(event) => events.push(event),
                Err(e) => {
                    bump(&self.stats.undecodable_records);
                    warn!(error = %e, "Skipping undecodable record");
                }
            }
        }

        let publishes = batch_events(events, self.config.max_payload_size_bytes);
        let mut handles = Vec::with_capacity(publishes.len());
        for publish in &publishes {
            if !uplink.is_connected() {
                debug!("Link dropped mid-pack");
                return Ok(PackOutcome::Aborted);
            }
            handles.push(self.send(&uplink, publish).await);
        }

        let ack_timeout = self.config.ack_timeout();
        for handle in handles {
            match handle.wait(ack_timeout).await {
                PublishResult::Success => {}
                failure => {
                    bump(&self.stats.publish_failures);
                    warn!(result = ?failure, records, "Publish not acknowledged, pack will be resent");
                    return Ok(PackOutcome::Aborted);
                }
            }
        }

        storage.event_pack_processing_done()?;
        bump(&self.stats.packs_delivered);
        self.stats
            .records_delivered
            .fetch_add(records as u64, std::sync::atomic::Ordering::Relaxed);
        debug!(records, publishes = publishes.len(), "Pack delivered");
        Ok(PackOutcome::Delivered {
            records,
            publishes: publishes.len(),
        })
    }

    /// Deliver packs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let base_retry = Duration::from_millis(self.config.link_retry_ms.max(1));
        let idle = Duration::from_millis(self.config.idle_poll_ms.max(1));
        let mut retry = base_retry;
        info!(qos = self.qos.level(), "Delivery engine started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pause = match self.process_pack().await {
                Ok(PackOutcome::Delivered { .. }) => {
                    retry = base_retry;
                    self.config.min_pack_send_delay()
                }
                Ok(PackOutcome::Empty) => idle,
                Ok(PackOutcome::Deferred) => idle.min(self.config.min_pack_send_delay()),
                Ok(PackOutcome::Aborted) => {
                    let pause = retry;
                    retry = (retry * 2).min(LINK_RETRY_CAP);
                    pause
                }
                Err(e) => {
                    error!(error = %e, "Delivery step failed");
                    let pause = retry;
                    retry = (retry * 2).min(LINK_RETRY_CAP);
                    pause
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Delivery engine stopped");
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("config", &self.config)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neogate_core::{ConvertedData, TelemetryEntry, TelemetryValues};
    use serde_json::json;

    fn event(device: &str, ts: i64, key: &str, value: i64) -> QueuedEvent {
        let mut values = TelemetryValues::new();
        values.insert(key.into(), json!(value));
        QueuedEvent::new(
            "modbus",
            "id-1",
            ConvertedData::new(device).with_telemetry(TelemetryEntry::with_ts(ts, values)),
        )
    }

    #[test]
    fn test_batch_groups_per_device_in_order() {
        let mut attr = event("d1", 1, "t", 20);
        attr.data.attributes.insert("fw".into(), json!("1.0"));
        let events = vec![attr, event("d2", 1, "t", 5), event("d1", 2, "t", 21)];

        let publishes = batch_events(events, 8196);
        assert_eq!(publishes.len(), 3);
        match &publishes[1] {
            Publish::Telemetry { device, points } => {
                assert_eq!(device, "d1");
                let ts: Vec<i64> = points.iter().map(|p| p.ts).collect();
                assert_eq!(ts, vec![1, 2]);
            }
            other => panic!("unexpected publish {other:?}"),
        }
        assert!(matches!(&publishes[0], Publish::Attributes { device, .. } if device == "d1"));
        assert!(matches!(&publishes[2], Publish::Telemetry { device, .. } if device == "d2"));
    }

    #[test]
    fn test_batch_flushes_at_payload_limit() {
        let events: Vec<QueuedEvent> = (0..50).map(|i| event("d1", i, "temperature", i)).collect();
        let publishes = batch_events(events, 200);
        assert!(publishes.len() > 1);

        let mut ts = Vec::new();
        for publish in &publishes {
            let Publish::Telemetry { points, .. } = publish else {
                panic!("expected telemetry");
            };
            assert!(json_len(points) <= 200);
            ts.extend(points.iter().map(|p| p.ts));
        }
        assert_eq!(ts, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_attribute_merge_keeps_latest_value() {
        let mut first = event("d1", 1, "t", 1);
        first.data.attributes.insert("mode".into(), json!("auto"));
        let mut second = event("d1", 2, "t", 2);
        second.data.attributes.insert("mode".into(), json!("manual"));
        let publishes = batch_events(vec![first, second], 8196);
        assert!(matches!(
            &publishes[0],
            Publish::Attributes { attributes, .. } if attributes["mode"] == json!("manual")
        ));
    }
}
