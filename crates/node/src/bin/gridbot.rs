//! Gridbot federation node.
//!
//! Runs one member of a robot-demo federation: an encrypted static-topology
//! overlay, a HotStuff consensus round driving replicated robot commands,
//! and persistent block/state storage with periodic pruning.
//!
//! # Usage
//!
//! ```bash
//! gridbot --config gridbot.toml --node-index 0
//! ```
//!
//! Exits 0 on clean shutdown and non-zero on configuration or validation
//! failure.

use anyhow::{Context, Result};
use clap::Parser;
use gridbot_node::{Config, Node};
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Gridbot federation node.
#[derive(Parser, Debug)]
#[command(name = "gridbot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// This node's 0-based index into `network.nodes`.
    #[arg(long)]
    node_index: usize,

    /// Log level filter (overrides RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load(&cli.config)?;
    let resolved = config
        .resolve(cli.node_index)
        .context("invalid configuration")?;

    info!(
        node_index = cli.node_index,
        federation_size = resolved.federation.len(),
        address = %resolved.local_address,
        "starting gridbot node"
    );

    let handle = Node::start(resolved).await.context("node startup failed")?;
    info!("node started, press ctrl-c to stop");

    handle.run_until(shutdown_signal()).await?;

    info!("shutdown complete");
    Ok(())
}
