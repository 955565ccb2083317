//! Remote reconfiguration: build the replacement, swap it in, or keep the old one.

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use common::{TestGateway, test_config, valve, wait_until};
use neogate_core::{
    ConfigurationUpdate, ConnectorIdentity, ConvertedData, DownlinkMessage, Error, GatewayConfig,
    StorageConfig, Uplink, UplinkConfig,
};
use neogate_gateway::PackOutcome;
use serde_json::json;

fn fast_uplink(host: &str) -> UplinkConfig {
    UplinkConfig {
        host: host.to_string(),
        connect_timeout_secs: 1,
        ..Default::default()
    }
}

fn sensor(value: i64) -> ConvertedData {
    ConvertedData::new("tank-level").with_value("level", value)
}

fn identity() -> ConnectorIdentity {
    ConnectorIdentity::new("opcua", "id-opcua", "opcua")
}

/// Add a connector to the file on disk as an operator would, with a modification time the
/// gateway cannot have recorded yet.
fn add_connector_on_disk(path: &Path, name: &str) {
    let mut edited = GatewayConfig::load(path).unwrap();
    edited.connectors.push(valve(name, json!({})));
    edited.save(path).unwrap();
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

async fn started_from_file(dir: &Path) -> (TestGateway, PathBuf) {
    let path = dir.join("gateway.toml");
    let mut config = test_config(dir);
    config.connectors = vec![valve("a", json!({}))];
    config.save(&path).unwrap();
    let test = TestGateway::with_path(config, Some(&path));
    test.gateway.start().await.unwrap();
    (test, path)
}

fn connector_names(config: &GatewayConfig) -> Vec<String> {
    config.connectors.iter().map(|c| c.name.clone()).collect()
}

#[tokio::test]
async fn test_unreachable_connection_keeps_current_link() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestGateway::new(test_config(dir.path()));
    let current = test.uplink();
    current.set_connected(true);

    test.factory.set_connectable(false);
    let result = test
        .gateway
        .reconfigurator()
        .apply(ConfigurationUpdate::Connection(fast_uplink("unreachable.invalid")))
        .await;

    assert!(matches!(result, Err(Error::Reconfiguration(_))));
    assert_eq!(test.factory.count(), 2);
    assert!(test.factory.latest().is_closed());
    assert!(current.is_connected());
    assert_eq!(test.gateway.config().uplink.host, "localhost");
    assert!(!test.gateway.reconfigurator().is_in_progress());

    test.gateway.ingest(&identity(), sensor(3));
    test.gateway.delivery().process_pack().await.unwrap();
    assert_eq!(current.telemetry_for("tank-level").len(), 1);
}

#[tokio::test]
async fn test_connection_swapped_and_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.toml");
    let config = test_config(dir.path());
    config.save(&path).unwrap();

    let test = TestGateway::with_path(config, Some(&path));
    let previous = test.uplink();
    previous.set_connected(true);

    test.gateway
        .reconfigurator()
        .apply(ConfigurationUpdate::Connection(fast_uplink("cloud.example.com")))
        .await
        .unwrap();

    assert!(previous.is_closed());
    let replacement = test.factory.latest();
    assert_eq!(replacement.config.host, "cloud.example.com");
    assert_eq!(test.gateway.config().uplink.host, "cloud.example.com");
    assert_eq!(GatewayConfig::load(&path).unwrap().uplink.host, "cloud.example.com");

    test.gateway.ingest(&identity(), sensor(7));
    test.gateway.delivery().process_pack().await.unwrap();
    assert_eq!(replacement.telemetry_for("tank-level").len(), 1);
    assert!(previous.sent().is_empty());
}

#[tokio::test]
async fn test_storage_swap_migrates_queued_records() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestGateway::new(test_config(dir.path()));
    for level in 0..5 {
        test.gateway.ingest(&identity(), sensor(level));
    }
    assert_eq!(test.gateway.queue_len(), 5);

    let file_storage = StorageConfig::File {
        data_folder: dir.path().join("queue"),
        max_file_count: 4,
        max_records_per_file: 2,
        read_records_count: 10,
    };
    test.gateway
        .reconfigurator()
        .apply(ConfigurationUpdate::Storage(file_storage.clone()))
        .await
        .unwrap();
    assert_eq!(test.gateway.queue_len(), 5);
    assert_eq!(test.gateway.config().storage, file_storage);

    let uplink = test.uplink();
    uplink.set_connected(true);
    let outcome = test.gateway.delivery().process_pack().await.unwrap();
    assert!(matches!(outcome, PackOutcome::Delivered { records: 5, .. }));
    let levels: Vec<_> = uplink
        .telemetry_for("tank-level")
        .iter()
        .map(|p| p.values["level"].clone())
        .collect();
    assert_eq!(levels, (0..5).map(|l| json!(l)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_storage_rollback_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestGateway::new(test_config(dir.path()));
    test.gateway.ingest(&identity(), sensor(1));
    test.gateway.ingest(&identity(), sensor(2));

    // The parent of the database path is a regular file, so the backend cannot open.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let result = test
        .gateway
        .reconfigurator()
        .apply(ConfigurationUpdate::Storage(StorageConfig::Redb {
            path: blocker.join("events.redb"),
            max_records_count: 100,
            read_records_count: 10,
        }))
        .await;

    assert!(result.is_err());
    assert_eq!(test.gateway.config().storage.kind(), "memory");
    assert_eq!(test.gateway.queue_len(), 2);
}

#[tokio::test]
async fn test_connector_set_rollback_then_replace() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.connectors = vec![valve("valves", json!({}))];
    let test = TestGateway::new(config);
    test.gateway.start().await.unwrap();
    let manager = test.gateway.connectors();
    assert!(manager.get("valves").unwrap().connector.is_connected());

    let broken = vec![
        valve("pumps", json!({})),
        valve("dampers", json!({ "fail_open": true })),
    ];
    let result = test
        .gateway
        .reconfigurator()
        .apply(ConfigurationUpdate::Connectors(broken))
        .await;
    assert!(result.is_err());
    assert_eq!(manager.names(), vec!["valves".to_string()]);
    assert!(manager.get("valves").unwrap().connector.is_connected());
    assert_eq!(test.gateway.config().connectors.len(), 1);

    test.gateway
        .reconfigurator()
        .apply(ConfigurationUpdate::Connectors(vec![valve("pumps", json!({}))]))
        .await
        .unwrap();
    assert_eq!(manager.names(), vec!["pumps".to_string()]);
    assert!(manager.get("pumps").unwrap().connector.is_connected());
    assert_eq!(test.gateway.config().connectors[0].name, "pumps");

    test.gateway.shutdown().await;
}

#[tokio::test]
async fn test_configuration_arrives_over_downlink() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestGateway::new(test_config(dir.path()));
    test.gateway.start().await.unwrap();

    let storage = StorageConfig::Memory {
        max_records_count: 42,
        read_records_count: 7,
    };
    test.factory
        .downlink()
        .send(DownlinkMessage::Configuration(ConfigurationUpdate::Storage(storage.clone())))
        .unwrap();

    let gateway = &test.gateway;
    assert!(wait_until(Duration::from_secs(2), || gateway.config().storage == storage).await);
    test.gateway.shutdown().await;
}

#[tokio::test]
async fn test_file_edit_adopted_and_kept_by_later_update() {
    let dir = tempfile::tempdir().unwrap();
    let (test, path) = started_from_file(dir.path()).await;
    let reconfigurator = test.gateway.reconfigurator();

    add_connector_on_disk(&path, "b");
    assert!(reconfigurator.reload_from_file().await.unwrap());
    assert_eq!(connector_names(&test.gateway.config()), vec!["a", "b"]);
    assert_eq!(test.gateway.connectors().len(), 2);

    let storage = StorageConfig::Memory {
        max_records_count: 50,
        read_records_count: 5,
    };
    reconfigurator
        .apply(ConfigurationUpdate::Storage(storage.clone()))
        .await
        .unwrap();
    let saved = GatewayConfig::load(&path).unwrap();
    assert_eq!(connector_names(&saved), vec!["a", "b"]);
    assert_eq!(saved.storage, storage);

    // The gateway's own write is not mistaken for an operator edit.
    let opens = test.recorder.opens.load(Ordering::SeqCst);
    assert!(!reconfigurator.reload_from_file().await.unwrap());
    assert_eq!(test.recorder.opens.load(Ordering::SeqCst), opens);
    test.gateway.shutdown().await;
}

#[tokio::test]
async fn test_unseen_file_edit_survives_remote_update() {
    let dir = tempfile::tempdir().unwrap();
    let (test, path) = started_from_file(dir.path()).await;
    let reconfigurator = test.gateway.reconfigurator();

    add_connector_on_disk(&path, "b");
    reconfigurator
        .apply(ConfigurationUpdate::Connection(fast_uplink("cloud.example.com")))
        .await
        .unwrap();
    let saved = GatewayConfig::load(&path).unwrap();
    assert_eq!(saved.uplink.host, "cloud.example.com");
    assert_eq!(connector_names(&saved), vec!["a", "b"]);

    assert!(reconfigurator.reload_from_file().await.unwrap());
    assert_eq!(connector_names(&test.gateway.config()), vec!["a", "b"]);
    test.gateway.shutdown().await;
}

#[tokio::test]
async fn test_file_reload_waits_for_running_reconfiguration() {
    let dir = tempfile::tempdir().unwrap();
    let (test, path) = started_from_file(dir.path()).await;
    let reconfigurator = test.gateway.reconfigurator().clone();

    // An unreachable uplink keeps the reconfiguration busy until its connect timeout.
    test.factory.set_connectable(false);
    let running = {
        let reconfigurator = reconfigurator.clone();
        tokio::spawn(async move {
            reconfigurator
                .apply(ConfigurationUpdate::Connection(fast_uplink("unreachable.invalid")))
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(1), || reconfigurator.is_in_progress()).await);

    add_connector_on_disk(&path, "b");
    let deferred = reconfigurator.reload_from_file().await;
    assert!(matches!(deferred, Err(Error::Reconfiguration(_))));
    assert_eq!(test.gateway.connectors().names(), vec!["a".to_string()]);

    assert!(running.await.unwrap().is_err());
    assert!(reconfigurator.reload_from_file().await.unwrap());
    assert_eq!(connector_names(&test.gateway.config()), vec!["a", "b"]);
    test.gateway.shutdown().await;
}
