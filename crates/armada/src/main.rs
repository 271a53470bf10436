//! Armada node binary.
//!
//! Wires configuration, logging and signal handling around a
//! [`LocalNode`] and keeps it running until a termination signal arrives
//! or a cluster-initiated drain completes.

mod cli;
mod config;
mod signals;

use anyhow::{Context, Result};
use armada_cluster::LocalNode;
use cli::CliArgs;
use config::{AppConfig, LoggingSettings};
use signals::setup_signal_handlers;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
fn setup_logging(config: &LoggingSettings) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    }

    info!(level = %config.level, "logging initialized");
    Ok(())
}

/// Display the startup banner through the logging system.
fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("+----------------------------------------+");
    info!("|            ARMADA NODE v{}          |", version);
    info!("|                                        |");
    info!("|  Clustered service orchestration       |");
    info!("|  with peer sync and tick scheduling    |");
    info!("+----------------------------------------+");
}

/// The assembled application: parsed configuration plus the node it runs.
struct Application {
    config: AppConfig,
    node: Arc<LocalNode>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and assembles the node.
    async fn new(args: CliArgs) -> Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(node_id) = args.node_id {
            config.node.id = node_id;
        }
        if let Some(bind_address) = args.bind_address {
            config.node.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config.validate().context("configuration validation failed")?;

        setup_logging(&config.logging)?;
        display_banner();

        let cluster_config = config.to_cluster_config()?;
        let node = LocalNode::new(cluster_config).context("assembling the local node")?;

        info!(
            config = %args.config_path.display(),
            node = %node.local_id(),
            "configuration loaded"
        );

        Ok(Self { config, node })
    }

    /// Runs the node until shutdown.
    async fn run(self) -> Result<()> {
        self.node
            .start()
            .await
            .context("starting the cluster listener")?;

        match self.node.listen_addr() {
            Some(addr) => info!(%addr, "cluster listener bound"),
            None => info!("cluster listener bound"),
        }
        info!(
            members = self.config.members.len(),
            ticks_per_second = self.config.timings.ticks_per_second,
            "node is running, press Ctrl+C to shut down"
        );

        // A drain request from a peer empties the node and then trips this
        // signal, so both paths end in the same shutdown sequence.
        let mut drained = self.node.shutdown_signal();
        tokio::select! {
            result = setup_signal_handlers() => {
                result?;
                info!("shutdown signal received, leaving the cluster");
            }
            _ = drained.changed() => {
                info!("cluster requested shutdown and the node is drained");
            }
        }

        self.node.shutdown().await;
        info!("node shutdown complete");

        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(error) = app.run().await {
                error!("application error: {error:?}");
                std::process::exit(1);
            }
        }
        Err(error) => {
            eprintln!("failed to start: {error:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
