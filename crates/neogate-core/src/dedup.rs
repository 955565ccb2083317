//! Change detection for attribute and telemetry keys.
//!
//! For each (device, key) the filter remembers the last value that was let through and
//! when. A key whose value is unchanged and was sent within the TTL is dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::data::ConvertedData;

#[derive(Debug, Clone)]
struct LastSent {
    value: Value,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct DeviceState {
    attributes: HashMap<String, LastSent>,
    telemetry: HashMap<String, LastSent>,
}

/// Per-device last-sent state.
#[derive(Debug)]
pub struct DedupFilter {
    ttl: Option<Duration>,
    devices: Mutex<HashMap<String, DeviceState>>,
}

/// Decide whether `value` must be sent, updating `slot` when it is.
fn admit(slot: &mut HashMap<String, LastSent>, key: &str, value: &Value, ttl: Option<Duration>, now: Instant) -> bool {
    if let Some(last) = slot.get(key) {
        let fresh = ttl.is_none_or(|ttl| now.duration_since(last.sent_at) < ttl);
        if last.value == *value && fresh {
            return false;
        }
    }
    slot.insert(
        key.to_string(),
        LastSent {
            value: value.clone(),
            sent_at: now,
        },
    );
    true
}

impl DedupFilter {
    /// `ttl = None` suppresses unchanged values indefinitely.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Drop unchanged keys from `data`. Returns `false` when nothing is left.
    pub fn filter(&self, data: &mut ConvertedData) -> bool {
        self.filter_at(data, Instant::now())
    }

    pub fn filter_at(&self, data: &mut ConvertedData, now: Instant) -> bool {
        let mut devices = self.devices.lock();
        let state = devices.entry(data.device_name.clone()).or_default();

        data.attributes
            .retain(|key, value| admit(&mut state.attributes, key, value, self.ttl, now));

        for entry in &mut data.telemetry {
            entry
                .values
                .retain(|key, value| admit(&mut state.telemetry, key, value, self.ttl, now));
        }
        data.telemetry.retain(|entry| !entry.values.is_empty());

        !data.is_empty()
    }

    /// Forget everything about a device.
    pub fn remove_device(&self, device_name: &str) {
        self.devices.lock().remove(device_name);
    }

    /// Carry state over to a new device name.
    pub fn rename_device(&self, old_name: &str, new_name: &str) {
        let mut devices = self.devices.lock();
        if let Some(state) = devices.remove(old_name) {
            devices.insert(new_name.to_string(), state);
        }
    }

    pub fn tracked_devices(&self) -> usize {
        self.devices.lock().len()
    }
}
