use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sensorhub_node::config::{self, NodeConfig};
use sensorhub_node::node::Node;

fn init_logging(config: &NodeConfig) -> Result<()> {
    // RUST_LOG wins; LOG_LEVEL supplies the default directive.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            if config.clear_log {
                let _ = std::fs::remove_file(path);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("config_error: cannot open LOG_FILE {path}"))?;
            let writer = std::sync::Mutex::new(file);
            if config.log_json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
        }
        None => {
            if config.log_json {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::parse();
    init_logging(&config)?;
    config.validate()?;
    let sensors = config::sensor_specs_from_env()?;

    tracing::info!(
        node_id = %config.node_id,
        sensors = sensors.len(),
        bootstrap_peers = config.bootstrap_peers.len(),
        "starting sensor hub node"
    );

    Node::new(config, sensors).run().await
}
