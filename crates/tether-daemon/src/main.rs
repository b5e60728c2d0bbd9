//! Tether Daemon
//!
//! Runs next to local coding-agent processes, keeps them healthy, and
//! holds an outbound tunnel to the orchestrator so that clients can reach
//! the agents without any inbound connectivity to this machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, DaemonConfig};
use tether_core::events::EventBus;
use tether_daemon::tunnel::Relay;
use tether_daemon::ProjectManager;

#[derive(Parser)]
#[command(name = "tetherd")]
#[command(about = "Tether daemon - bridges local coding agents to the relay")]
#[command(version)]
struct Args {
    /// Orchestrator tunnel URL, e.g. wss://relay.example.com/tunnel
    #[arg(short, long)]
    orchestrator: Option<String>,

    /// Bearer token for the tunnel (overrides config and any stored
    /// device key)
    #[arg(long)]
    token: Option<String>,

    /// Pairing code minted by a client; exchanged for a device key once
    /// the tunnel is up
    #[arg(long)]
    code: Option<String>,

    /// Project to serve, as name=directory. Repeatable.
    #[arg(short, long = "project", value_name = "NAME=DIR")]
    projects: Vec<String>,

    /// Attach to already-running agent processes instead of spawning them
    #[arg(long)]
    attach_only: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
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

    tracing::info!("Tether daemon starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("daemon.toml"));

    let mut config = if config_path.exists() {
        config::load_config::<DaemonConfig>(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            DaemonConfig::default()
        })
    } else {
        DaemonConfig::default()
    };

    // Apply command-line overrides
    if let Some(orchestrator) = args.orchestrator {
        config.orchestrator_url = orchestrator;
    }
    if args.attach_only {
        config.skip_spawn = true;
    }
    let cli_projects = parse_project_args(&args.projects)?;

    let events = Arc::new(EventBus::new());
    let projects = Arc::new(ProjectManager::new(
        config.clone(),
        Some(config_path),
        Arc::clone(&events),
    ));

    // Start configured projects first, then any given on the command line
    for entry in &config.projects {
        if let Err(e) = projects.start_project(&entry.name, &entry.directory).await {
            tracing::error!("Failed to start project {}: {}", entry.name, e);
        }
    }
    for (name, directory) in cli_projects {
        if let Err(e) = projects.start_project(&name, &directory).await {
            tracing::error!("Failed to start project {}: {}", name, e);
        }
    }

    if let Some(token) = args.token {
        config.auth_token = token;
        // An explicit token also beats a previously stored device key
        let _ = std::fs::remove_file(&config.device_key_path);
    }

    tracing::info!("Connecting to orchestrator at {}", config.orchestrator_url);
    let relay = Arc::new(Relay::new(config, Arc::clone(&projects), events));

    let runner = tokio::spawn(Arc::clone(&relay).run());

    if let Some(code) = args.code {
        pair(&relay, &code).await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            relay.disconnect();
        }
        _ = runner => {
            tracing::warn!("Tunnel loop exited");
        }
    }

    projects.shutdown().await;
    Ok(())
}

/// Exchange a pairing code for a device key once the tunnel is up
async fn pair(relay: &Arc<Relay>, code: &str) -> Result<()> {
    // The tunnel connects in the background; wait for it briefly
    let mut waited = Duration::ZERO;
    while !relay.is_connected() {
        if waited >= Duration::from_secs(30) {
            anyhow::bail!("Tunnel did not come up; cannot pair");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        waited += Duration::from_millis(250);
    }

    let outcome = relay
        .request_pairing(code)
        .await
        .context("Pairing exchange failed")?;

    if outcome.success {
        tracing::info!("Paired successfully; device key stored");
        Ok(())
    } else {
        anyhow::bail!(
            "Pairing rejected: {}",
            outcome.error.as_deref().unwrap_or("unknown reason")
        )
    }
}

/// Parse repeated `--project name=dir` arguments
fn parse_project_args(specs: &[String]) -> Result<Vec<(String, PathBuf)>> {
    specs
        .iter()
        .map(|spec| {
            let (name, dir) = spec
                .split_once('=')
                .with_context(|| format!("Invalid project spec {:?}, expected name=dir", spec))?;
            if name.is_empty() || dir.is_empty() {
                anyhow::bail!("Invalid project spec {:?}, expected name=dir", spec);
            }
            Ok((name.to_string(), PathBuf::from(dir)))
        })
        .collect()
}
