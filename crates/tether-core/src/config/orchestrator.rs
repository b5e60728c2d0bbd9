//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address to bind the HTTP/WebSocket server to
    pub bind_address: String,

    /// Development key accepted for tunnel auth alongside issued device keys
    pub dev_key: String,

    /// How long a relayed command may stay in flight before it is failed
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// How long a pairing code stays valid
    #[serde(with = "duration_secs")]
    pub pairing_ttl: Duration,

    /// Where issued device keys are persisted
    pub device_key_store_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8787".to_string(),
            dev_key: super::daemon::DEV_KEY.to_string(),
            command_timeout: Duration::from_secs(120),
            pairing_ttl: Duration::from_secs(300),
            device_key_store_path: super::default_config_dir().join("device_keys.toml"),
        }
    }
}
