mod cache;
mod cli;
mod config;
mod dispatch;
mod error;
mod hypervisor;
mod locks;
mod metrics;
mod pool;
mod provision;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::dispatch::Dispatcher;
use crate::hypervisor::virsh::{VirshConnector, VirshSettings};
use crate::metrics::MetricsRegistry;

#[derive(Parser)]
#[command(name = "kvmctl", about = "JSON-RPC control server for KVM/libvirt virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-RPC requests on stdin/stdout.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Port for Prometheus metrics and health endpoints (/metrics, /healthz).
        /// Disabled if not set.
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Verify tools, paths and hypervisor access. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(config).await?;
        }
        Commands::Serve { config: config_path, metrics_port } => {
            let config = Arc::new(cli::load_config(config_path)?);
            let session = uuid::Uuid::new_v4();
            info!(session = %session, uri = %config.hypervisor.uri, "kvmctl starting");

            let connector = Arc::new(VirshConnector::new(VirshSettings::from_config(&config)));
            let metrics = metrics_port.map(|_| MetricsRegistry::new());
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::clone(&config),
                connector,
                metrics.clone(),
            ));

            let domains = dispatcher.probe().await.with_context(|| {
                format!("cannot reach hypervisor at {}", config.hypervisor.uri)
            })?;
            info!(domains, "hypervisor reachable");

            if let (Some(port), Some(m)) = (metrics_port, metrics) {
                let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
                metrics::start_metrics_server(addr, m, Arc::clone(&dispatcher));
            }

            info!("kvmctl ready, serving JSON-RPC on stdio");
            server::serve(
                dispatcher,
                tokio::io::stdin(),
                tokio::io::stdout(),
                shutdown_signal(),
            )
            .await?;
            info!(session = %session, "kvmctl stopped");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
