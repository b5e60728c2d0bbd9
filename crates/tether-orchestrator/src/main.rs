//! Tether Orchestrator
//!
//! Accepts one authenticated daemon tunnel and relays client HTTP
//! traffic onto it as correlated frames.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, OrchestratorConfig, DEV_KEY};
use tether_orchestrator::{server, OrchestratorState};

#[derive(Parser)]
#[command(name = "tether-orchestrator")]
#[command(about = "Tether orchestrator - relays client traffic to daemons")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tether orchestrator starting...");

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_dir().join("orchestrator.toml");
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                OrchestratorConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            OrchestratorConfig::default()
        }
    };

    let bind_address = args.bind.unwrap_or_else(|| config.bind_address.clone());

    if config.dev_key == DEV_KEY {
        tracing::warn!("Running with the built-in development key; pair a device for production use");
    }

    let state = Arc::new(OrchestratorState::new(config));
    if !state.keys.is_empty() {
        tracing::info!("{} paired device keys on file", state.keys.len());
    }

    // Graceful shutdown on Ctrl+C / SIGTERM
    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }

        cancel_signal.cancel();
    });

    server::serve(state, &bind_address, cancel).await?;

    tracing::info!("Orchestrator shutdown complete");
    Ok(())
}
