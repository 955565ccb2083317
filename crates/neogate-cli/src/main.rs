//! Command-line interface for the NeoGate protocol gateway.

mod simulator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use neogate_core::{ConnectorRegistry, GatewayConfig, UplinkFactory};
use neogate_gateway::Gateway;

/// NeoGate - bridge field protocols to an IoT cloud.
#[derive(Parser, Debug)]
#[command(name = "neogate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until interrupted.
    Run {
        /// Gateway configuration file.
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
    },
    /// Load and validate a configuration file, then print a summary.
    CheckConfig {
        /// Gateway configuration file.
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
    },
    /// List the connector types this binary can instantiate.
    ConnectorTypes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run { config } => run(&config).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::ConnectorTypes => {
            for connector_type in simulator::builtin_registry().types() {
                println!("{}", connector_type);
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    // JSON output for container deployments
    let json_logging = std::env::var("NEOGATE_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    GatewayConfig::load(path).with_context(|| format!("invalid configuration {}", path.display()))
}

fn unknown_types(config: &GatewayConfig, registry: &ConnectorRegistry) -> Vec<String> {
    config
        .connectors
        .iter()
        .filter(|c| c.enabled && !registry.contains(&c.connector_type))
        .map(|c| format!("{} ({})", c.name, c.connector_type))
        .collect()
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let registry = simulator::builtin_registry();

    println!("Configuration: {}", path.display());
    println!("  uplink:     {}:{} qos {}", config.uplink.host, config.uplink.port, config.uplink.qos);
    println!("  storage:    {}", config.storage.kind());
    println!("  state:      {}", config.state_path().display());
    println!("  connectors: {}", config.connectors.len());
    for connector in &config.connectors {
        let state = if connector.enabled { "enabled" } else { "disabled" };
        println!("    - {} [{}] {}", connector.name, connector.connector_type, state);
    }

    let unknown = unknown_types(&config, &registry);
    if !unknown.is_empty() {
        bail!("unknown connector types: {}", unknown.join(", "));
    }
    println!("OK");
    Ok(())
}

#[cfg(feature = "mqtt")]
fn uplink_factory() -> Result<Arc<dyn UplinkFactory>> {
    Ok(Arc::new(neogate_gateway::MqttUplinkFactory))
}

#[cfg(not(feature = "mqtt"))]
fn uplink_factory() -> Result<Arc<dyn UplinkFactory>> {
    bail!("this build has no uplink transport; rebuild with the `mqtt` feature")
}

async fn run(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let registry = simulator::builtin_registry();
    for entry in unknown_types(&config, &registry) {
        tracing::warn!(connector = %entry, "Connector type not available in this build");
    }

    let gateway = Gateway::new(config, Some(path.to_path_buf()), registry, uplink_factory()?)
        .context("failed to build gateway")?;
    gateway.start().await.context("failed to start gateway")?;
    tracing::info!(version = neogate_gateway::VERSION, "NeoGate running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    gateway.shutdown().await;
    Ok(())
}
