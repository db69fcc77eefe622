use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use lb_control_plane::config::loader::load_config;
use lb_control_plane::config::validation::validate_config;
use lb_control_plane::config::ConfigError;
use lb_control_plane::lifecycle::{spawn_signal_handler, Node, Shutdown};
use lb_control_plane::observability::{logging, metrics};
use lb_control_plane::NodeConfig;

/// Load-balancer control plane node.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Node configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `node.id`.
    #[arg(long)]
    node_id: Option<String>,

    /// Override `publisher.groups_file`.
    #[arg(long)]
    groups: Option<PathBuf>,

    /// Seconds to wait for graceful leave on shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };
    if let Some(id) = args.node_id {
        config.node.id = id;
    }
    if let Some(groups) = args.groups {
        config.publisher.groups_file = Some(groups);
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node.id,
        config = ?args.config,
        "lb-control-plane starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let node = Node::start(config, shutdown).await?;
    node.wait(Duration::from_secs(args.shutdown_grace_secs)).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
