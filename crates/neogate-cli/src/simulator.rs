//! Built-in `simulator` connector.
//!
//! Emits synthetic telemetry for a configured set of devices on a fixed interval. Useful for
//! exercising an uplink end to end without field hardware.
//!
//! ```toml
//! [[connectors]]
//! name = "demo"
//! type = "simulator"
//! configuration = { interval_ms = 1000, devices = [{ name = "boiler-1", type = "boiler", keys = ["temperature", "pressure"] }] }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use neogate_core::{
    AttributeUpdate, Connector, ConnectorConfig, ConnectorContext, ConnectorRegistry,
    ConvertedData, Error, IngestStatus, Result, RpcRequest,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CONNECTOR_TYPE: &str = "simulator";

#[derive(Debug, Clone, Deserialize)]
struct SimulatedDevice {
    name: String,
    #[serde(rename = "type", default = "default_device_type")]
    device_type: String,
    #[serde(default)]
    keys: Vec<String>,
}

fn default_device_type() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct SimulatorSettings {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default)]
    devices: Vec<SimulatedDevice>,
}

fn default_interval_ms() -> u64 {
    1000
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SimulatorConnector {
    name: String,
    config: Value,
    settings: SimulatorSettings,
    context: ConnectorContext,
    connected: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl SimulatorConnector {
    pub fn new(config: ConnectorConfig, context: ConnectorContext) -> Result<Self> {
        let settings: SimulatorSettings = if config.configuration.is_null() {
            SimulatorSettings {
                interval_ms: default_interval_ms(),
                devices: Vec::new(),
            }
        } else {
            serde_json::from_value(config.configuration.clone()).map_err(|e| {
                Error::Config(format!("simulator '{}': {}", config.name, e))
            })?
        };
        if settings.interval_ms == 0 {
            return Err(Error::Config(format!(
                "simulator '{}': interval_ms must be positive",
                config.name
            )));
        }
        Ok(Self {
            name: config.name,
            config: config.configuration,
            settings,
            context,
            connected: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        })
    }
}

/// Deterministic wave so consecutive readings differ and change detection has work to do.
fn reading(tick: u64, key_index: usize) -> f64 {
    let phase = tick as f64 / 10.0 + key_index as f64;
    ((20.0 + 5.0 * phase.sin()) * 10.0).round() / 10.0
}

async fn emit_loop(
    context: ConnectorContext,
    devices: Vec<SimulatedDevice>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for device in &devices {
            let mut data = ConvertedData::new(&device.name).with_type(&device.device_type);
            for (index, key) in device.keys.iter().enumerate() {
                data = data.with_value(key, reading(tick, index));
            }
            match context.send_to_storage(data) {
                IngestStatus::Success | IngestStatus::NoNewData => {}
                status => warn!(device = %device.name, ?status, "Simulated reading rejected"),
            }
        }
        tick += 1;
    }
}

#[async_trait]
impl Connector for SimulatorConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn config(&self) -> &Value {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn open(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        for device in &self.settings.devices {
            self.context.add_device(&device.name, &device.device_type);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(emit_loop(
            self.context.clone(),
            self.settings.devices.clone(),
            Duration::from_millis(self.settings.interval_ms),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        self.connected.store(true, Ordering::Release);
        info!(
            connector = %self.name,
            devices = self.settings.devices.len(),
            "Simulator started"
        );
        Ok(())
    }

    async fn close(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            let _ = task.await;
            info!(connector = %self.name, "Simulator stopped");
        }
        self.connected.store(false, Ordering::Release);
    }

    async fn on_attributes_update(&self, update: AttributeUpdate) -> Result<()> {
        debug!(connector = %self.name, device = %update.device, keys = update.data.len(), "Attribute update");
        Ok(())
    }

    async fn server_side_rpc_handler(&self, request: RpcRequest) -> Result<()> {
        let device = request.is_device_bound().then(|| request.device.clone());
        let payload = match request.data.method.as_str() {
            "echo" => json!({ "success": true, "result": request.data.params }),
            other => json!({ "success": false, "error": format!("unsupported method '{}'", other) }),
        };
        self.context.send_rpc_reply(device, request.data.id, payload);
        Ok(())
    }
}

/// Registry holding every connector type this binary ships with.
pub fn builtin_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register(CONNECTOR_TYPE, |config, context| {
        Ok(Arc::new(SimulatorConnector::new(config, context)?) as Arc<dyn Connector>)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings_vary_between_ticks() {
        assert_ne!(reading(0, 0), reading(5, 0));
        assert_ne!(reading(0, 0), reading(0, 1));
    }

    #[test]
    fn test_settings_parse() {
        let settings: SimulatorSettings = serde_json::from_value(json!({
            "devices": [{ "name": "boiler-1", "keys": ["temperature"] }]
        }))
        .unwrap();
        assert_eq!(settings.interval_ms, 1000);
        assert_eq!(settings.devices[0].device_type, "default");
    }

    #[test]
    fn test_registry_knows_simulator() {
        assert_eq!(builtin_registry().types(), vec![CONNECTOR_TYPE.to_string()]);
    }
}
