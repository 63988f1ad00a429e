//! fleetd — the fleet domain daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/d1.toml --status-port 8480
//! fleetd run --config /etc/fleet/d1.toml --once
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use fleet_core::DomainConfig;
use fleet_transport::SshExecutor;
use fleetd::Domain;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet domain daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the domain until interrupted.
    Run {
        /// Domain config file.
        #[arg(long)]
        config: PathBuf,

        /// Run one reconcile tick and one heartbeat tick, then exit.
        #[arg(long)]
        once: bool,

        /// Serve the read-only status API on this port.
        #[arg(long)]
        status_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleet=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            once,
            status_port,
        } => run(&config, once, status_port).await,
    }
}

async fn run(config_path: &Path, once: bool, status_port: Option<u16>) -> anyhow::Result<()> {
    let config = DomainConfig::from_file(config_path)?;
    info!(
        domain = %config.domain.name,
        roles = config.roles.len(),
        backend = ?config.domain.backend,
        sandbox = ?config.lifecycle.sandbox,
        "domain config loaded"
    );

    let executor = Arc::new(SshExecutor::new(&config.transport));
    let domain = Domain::assemble(config, executor)?;

    if once {
        let reconcile = domain.daemon.reconcile_tick().await;
        let heartbeat = domain.daemon.heartbeat_tick().await;
        info!(?reconcile, ?heartbeat, "single pass complete");
        return Ok(());
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon_handle = tokio::spawn(Arc::clone(&domain.daemon).run(shutdown_rx));

    let interrupted = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    };

    match status_port {
        Some(port) => {
            let router = fleetd::api::build_router(Arc::clone(&domain.plan));
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            info!(%addr, "status API starting");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(interrupted)
                .await?;
        }
        None => interrupted.await,
    }

    // Let the loops finish their current tick.
    let _ = daemon_handle.await;

    info!("fleet daemon stopped");
    Ok(())
}
