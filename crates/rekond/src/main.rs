//! rekond — the rekon daemon binary.
//!
//! # Usage
//!
//! ```text
//! rekond serve --config /etc/rekon/rekon.toml --port 8080 --data-dir /var/lib/rekon
//! rekond check-config --config /etc/rekon/rekon.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use rekon_core::RekonConfig;
use rekon_state::StateStore;
use tracing::{info, warn};

use rekond::{Daemon, telemetry};

#[derive(Parser)]
#[command(name = "rekond", about = "rekon resource reconciliation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Path to rekon.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse and validate a config file, then print the effective config.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            telemetry::init(&config.logging)?;
            serve(config).await
        }
        Command::CheckConfig { config } => {
            let config = RekonConfig::from_file(&config)?;
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RekonConfig> {
    match path {
        Some(path) => RekonConfig::from_file(path),
        None => Ok(RekonConfig::default()),
    }
}

async fn serve(config: RekonConfig) -> anyhow::Result<()> {
    info!("rekon daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("rekon.redb");
    let store = StateStore::open(&db_path)?
        .with_timeout(Duration::from_millis(config.store.timeout_ms));
    info!(path = ?db_path, "state store opened");

    let daemon = Daemon::start(&config, store, Vec::new())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, daemon.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    daemon
        .shutdown(Duration::from_millis(config.server.shutdown_timeout_ms))
        .await;
    info!("rekon daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
