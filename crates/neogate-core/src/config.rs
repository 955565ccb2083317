//! Gateway configuration.
//!
//! The whole gateway is described by one TOML file. Every section has defaults so a
//! minimal file only needs the uplink host and the connector list.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Directory for the persisted gateway state (device directory, connector keys).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Connector configuration recheck interval. 0 disables the poller.
    #[serde(default = "default_check_connectors_secs")]
    pub check_connectors_configuration_secs: u64,

    /// Idle-device reaper period.
    #[serde(default = "default_idle_check_period_secs")]
    pub idle_check_period_secs: u64,

    #[serde(default)]
    pub uplink: UplinkConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub device_filter: DeviceFilterConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_check_connectors_secs() -> u64 {
    60
}

fn default_idle_check_period_secs() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            check_connectors_configuration_secs: default_check_connectors_secs(),
            idle_check_period_secs: default_idle_check_period_secs(),
            uplink: UplinkConfig::default(),
            storage: StorageConfig::default(),
            delivery: DeliveryConfig::default(),
            dedup: DedupConfig::default(),
            device_filter: DeviceFilterConfig::default(),
            rpc: RpcConfig::default(),
            connectors: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save the configuration, replacing the file atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = self.to_toml()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.uplink.validate()?;
        self.delivery.validate()?;
        self.device_filter.validate()?;

        let mut names = HashSet::new();
        for connector in &self.connectors {
            if connector.name.trim().is_empty() {
                return Err(Error::Config("connector name must not be empty".into()));
            }
            if connector.connector_type.trim().is_empty() {
                return Err(Error::Config(format!(
                    "connector '{}' has no type",
                    connector.name
                )));
            }
            if !names.insert(connector.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate connector name '{}'",
                    connector.name
                )));
            }
        }
        Ok(())
    }

    /// Path of the persisted gateway state database.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("gateway_state.redb")
    }
}

/// Cloud link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID (auto-generated if not provided)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Device access token, sent as the MQTT username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// QoS for data publishes (0 or 1).
    #[serde(default = "default_qos")]
    pub qos: u8,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_min_reconnect_delay")]
    pub min_reconnect_delay_secs: u64,

    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,

    /// How long a freshly created link may take to reach the connected state.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    60
}

fn default_min_reconnect_delay() -> u64 {
    1
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            access_token: None,
            password: None,
            qos: default_qos(),
            keep_alive_secs: default_keep_alive(),
            min_reconnect_delay_secs: default_min_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl UplinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("uplink host must not be empty".into()));
        }
        if self.qos > 1 {
            return Err(Error::Config(format!("unsupported uplink qos {}", self.qos)));
        }
        if self.min_reconnect_delay_secs > self.max_reconnect_delay_secs {
            return Err(Error::Config(
                "min_reconnect_delay_secs exceeds max_reconnect_delay_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Event storage backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory {
        #[serde(default = "default_max_records")]
        max_records_count: usize,
        #[serde(default = "default_read_records")]
        read_records_count: usize,
    },
    File {
        data_folder: PathBuf,
        #[serde(default = "default_max_file_count")]
        max_file_count: usize,
        #[serde(default = "default_max_records_per_file")]
        max_records_per_file: usize,
        #[serde(default = "default_read_records")]
        read_records_count: usize,
    },
    Redb {
        path: PathBuf,
        #[serde(default = "default_max_records")]
        max_records_count: usize,
        #[serde(default = "default_read_records")]
        read_records_count: usize,
    },
}

fn default_max_records() -> usize {
    100_000
}

fn default_read_records() -> usize {
    100
}

fn default_max_file_count() -> usize {
    10
}

fn default_max_records_per_file() -> usize {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            max_records_count: default_max_records(),
            read_records_count: default_read_records(),
        }
    }
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Memory { .. } => "memory",
            StorageConfig::File { .. } => "file",
            StorageConfig::Redb { .. } => "redb",
        }
    }
}

/// Delivery engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_payload")]
    pub max_payload_size_bytes: usize,

    #[serde(default = "default_min_pack_send_delay")]
    pub min_pack_send_delay_ms: u64,

    #[serde(default = "default_min_pack_size")]
    pub min_pack_size_to_send: usize,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,

    #[serde(default = "default_link_retry")]
    pub link_retry_ms: u64,
}

fn default_max_payload() -> usize {
    8196
}

fn default_min_pack_send_delay() -> u64 {
    50
}

fn default_min_pack_size() -> usize {
    0
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_idle_poll() -> u64 {
    100
}

fn default_link_retry() -> u64 {
    500
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_payload_size_bytes: default_max_payload(),
            min_pack_send_delay_ms: default_min_pack_send_delay(),
            min_pack_size_to_send: default_min_pack_size(),
            ack_timeout_secs: default_ack_timeout(),
            idle_poll_ms: default_idle_poll(),
            link_retry_ms: default_link_retry(),
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_size_bytes == 0 {
            return Err(Error::Config("max_payload_size_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn min_pack_send_delay(&self) -> Duration {
        Duration::from_millis(self.min_pack_send_delay_ms)
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DedupConfig {
    /// Apply change detection to every connector.
    #[serde(default)]
    pub enabled: bool,

    /// Window during which an unchanged value is suppressed. Absent means forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl DedupConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Allow/deny device policy keyed by connector name (or `"*"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub deny: HashMap<String, Vec<String>>,
}

impl DeviceFilterConfig {
    pub fn validate(&self) -> Result<()> {
        for pattern in self.allow.values().chain(self.deny.values()).flatten() {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }
}

/// RPC correlation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    200
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_rpc_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl RpcConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// One connector entry of the gateway file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub name: String,

    /// Type tag resolved against the connector registry.
    #[serde(rename = "type")]
    pub connector_type: String,

    /// Explicit connector id; generated and persisted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub send_data_only_on_change: bool,

    /// Devices idle for longer are disconnected. Absent disables the policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout_secs: Option<u64>,

    /// External JSON file holding the connector-specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_file: Option<PathBuf>,

    /// Inline connector-specific configuration.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub configuration: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>, connector_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connector_type: connector_type.into(),
            id: None,
            enabled: true,
            send_data_only_on_change: false,
            inactivity_timeout_secs: None,
            configuration_file: None,
            configuration: serde_json::Value::Null,
        }
    }

    /// Location of the external configuration file, if any.
    pub fn configuration_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.configuration_file.as_ref().map(|file| {
            if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            }
        })
    }

    /// Resolve `configuration_file` relative to `base_dir` and load it into `configuration`.
    pub fn resolve_configuration(&mut self, base_dir: &Path) -> Result<()> {
        let Some(path) = self.configuration_path(base_dir) else {
            return Ok(());
        };
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "connector '{}': cannot read {}: {}",
                self.name,
                path.display(),
                e
            ))
        })?;
        self.configuration = serde_json::from_str(&text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
data_dir = "/var/lib/neogate"
check_connectors_configuration_secs = 30

[uplink]
host = "cloud.example.com"
access_token = "secret"
qos = 1

[storage]
type = "file"
data_folder = "/var/lib/neogate/events"
max_file_count = 5

[delivery]
max_payload_size_bytes = 4096

[dedup]
enabled = true
ttl_secs = 60

[device_filter]
enabled = true
deny = { modbus = ["Test.*"] }

[[connectors]]
name = "modbus"
type = "modbus"
inactivity_timeout_secs = 120

[connectors.configuration]
host = "10.0.0.5"
"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.uplink.host, "cloud.example.com");
        assert_eq!(config.uplink.port, 1883);
        assert_eq!(config.delivery.max_payload_size_bytes, 4096);
        assert_eq!(config.dedup.ttl(), Some(Duration::from_secs(60)));
        assert!(matches!(
            config.storage,
            StorageConfig::File { max_file_count: 5, max_records_per_file: 10_000, .. }
        ));
        assert_eq!(config.connectors.len(), 1);
        assert_eq!(config.connectors[0].configuration["host"], "10.0.0.5");
        assert!(config.connectors[0].enabled);
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.storage.kind(), "memory");
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = GatewayConfig::default();
        config.connectors.push(ConnectorConfig::new("a", "modbus"));
        config.connectors.push(ConnectorConfig::new("a", "bacnet"));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = GatewayConfig::default();
        config
            .device_filter
            .deny
            .insert("*".into(), vec!["(unclosed".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        let config = GatewayConfig::from_toml(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_resolve_configuration_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mqtt.json"), r#"{"broker": "b1"}"#).unwrap();
        let mut connector = ConnectorConfig::new("mqtt", "mqtt");
        connector.configuration_file = Some(PathBuf::from("mqtt.json"));
        connector.resolve_configuration(dir.path()).unwrap();
        assert_eq!(connector.configuration["broker"], "b1");
    }
}
