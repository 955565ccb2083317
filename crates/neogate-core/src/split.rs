//! Oversize record repacking.
//!
//! A record whose encoding exceeds the payload limit is cut into several records of the
//! same device. Keys are packed greedily in order: attributes first, then telemetry grouped
//! by timestamp. A timestamp group that does not fit is continued in the next record under
//! the same timestamp. No key is lost or duplicated.

use serde_json::Value;
use tracing::warn;

use crate::data::{ConvertedData, TelemetryEntry, TelemetryValues};

fn json_len<T: serde::Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Encoded size of `"key":value,`.
fn key_cost(key: &str, value: &Value) -> usize {
    json_len(key) + json_len(value) + 2
}

/// Encoded size of an empty telemetry entry plus its separator.
fn group_cost(ts: &Option<Value>) -> usize {
    json_len(&TelemetryEntry {
        ts: ts.clone(),
        values: TelemetryValues::new(),
    }) + 1
}

struct Packer {
    max: usize,
    template: ConvertedData,
    empty_size: usize,
    current: ConvertedData,
    size: usize,
    out: Vec<ConvertedData>,
}

impl Packer {
    fn new(source: &ConvertedData, max: usize) -> Self {
        let template = ConvertedData::new(source.device_name.clone()).with_type(source.device_type.clone());
        let empty_size = template.payload_size();
        Self {
            max,
            current: template.clone(),
            template,
            empty_size,
            size: empty_size,
            out: Vec::new(),
        }
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            let full = std::mem::replace(&mut self.current, self.template.clone());
            self.out.push(full);
        }
        self.size = self.empty_size;
    }

    fn make_room(&mut self, cost: usize) {
        if self.size + cost > self.max && !self.current.is_empty() {
            self.flush();
        }
    }

    fn warn_if_oversized(&self, key: &str) {
        if self.size > self.max {
            warn!(
                device = %self.template.device_name,
                key = %key,
                size = self.size,
                max = self.max,
                "Single key exceeds the payload limit, sending it alone"
            );
        }
    }

    fn push_attribute(&mut self, key: String, value: Value) {
        let cost = key_cost(&key, &value);
        self.make_room(cost);
        self.size += cost;
        self.warn_if_oversized(&key);
        self.current.attributes.insert(key, value);
    }

    fn push_value(&mut self, ts: &Option<Value>, key: String, value: Value) {
        let cost = key_cost(&key, &value);
        let open_group = self.current.telemetry.last().is_some_and(|e| &e.ts == ts);
        let needed = if open_group { cost } else { cost + group_cost(ts) };
        self.make_room(needed);

        // A flush closes the open group.
        let open_group = self.current.telemetry.last().is_some_and(|e| &e.ts == ts);
        if !open_group {
            self.size += group_cost(ts);
            self.current.telemetry.push(TelemetryEntry {
                ts: ts.clone(),
                values: TelemetryValues::new(),
            });
        }
        self.size += cost;
        self.warn_if_oversized(&key);
        if let Some(entry) = self.current.telemetry.last_mut() {
            entry.values.insert(key, value);
        }
    }

    fn finish(mut self) -> Vec<ConvertedData> {
        self.flush();
        self.out
    }
}

/// Cut `data` into records whose encoding fits `max_payload` bytes.
///
/// Records already within the limit are returned unchanged.
pub fn split_converted_data(data: ConvertedData, max_payload: usize) -> Vec<ConvertedData> {
    if data.payload_size() <= max_payload {
        return vec![data];
    }

    let mut packer = Packer::new(&data, max_payload);
    for (key, value) in data.attributes {
        packer.push_attribute(key, value);
    }
    for entry in data.telemetry {
        for (key, value) in entry.values {
            packer.push_value(&entry.ts, key, value);
        }
    }
    packer.finish()
}
