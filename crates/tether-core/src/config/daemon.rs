//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Fixed development key accepted on both ends until a device key is paired
pub const DEV_KEY: &str = "tether-dev-key";

/// Configuration for the tether daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Orchestrator tunnel endpoint, e.g. `wss://relay.example.com/tunnel`
    pub orchestrator_url: String,

    /// Bearer token for the tunnel upgrade. Defaults to the development
    /// key; replaced by an issued device key once pairing completes.
    pub auth_token: String,

    /// Where the issued device key is persisted after pairing
    pub device_key_path: PathBuf,

    /// First port handed to a managed agent process; subsequent projects
    /// get sequential ports from here.
    pub base_port: u16,

    /// Skip spawning agent processes entirely (attach-only deployments
    /// and tests)
    pub skip_spawn: bool,

    /// Program used to launch a managed agent process
    pub agent_command: String,

    /// Arguments for the agent process. The tokens `{port}` and `{dir}`
    /// are substituted per project.
    pub agent_args: Vec<String>,

    /// How long to wait for a spawned agent process to report ready
    #[serde(with = "duration_secs")]
    pub spawn_ready_timeout: Duration,

    /// Heartbeat interval on the tunnel
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Reconnect backoff parameters
    pub backoff: BackoffConfig,

    /// Health probing parameters
    pub health: HealthConfig,

    /// Projects to start at boot
    pub projects: Vec<ProjectEntry>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "ws://localhost:8787/tunnel".to_string(),
            auth_token: DEV_KEY.to_string(),
            device_key_path: super::default_config_dir().join("device_key"),
            base_port: 4100,
            skip_spawn: false,
            agent_command: "opencode".to_string(),
            agent_args: vec![
                "serve".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
                "--cwd".to_string(),
                "{dir}".to_string(),
            ],
            spawn_ready_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            projects: vec![],
        }
    }
}

/// A project declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    /// Project name, unique case-insensitively
    pub name: String,
    /// Working directory handed to the agent process
    pub directory: PathBuf,
}

/// Exponential backoff configuration for tunnel reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay for attempt 0, in milliseconds
    pub base_delay_ms: u64,
    /// Delay cap, in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0), added on top of the exponential delay
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.3,
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between timer-driven probes
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,

    /// Timeout for a single probe
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,

    /// Consecutive failures before a process is considered down
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}
