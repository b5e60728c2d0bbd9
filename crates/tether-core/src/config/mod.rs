//! Configuration management for tether

mod daemon;
mod orchestrator;
pub mod serde_utils;

pub use daemon::{BackoffConfig, DaemonConfig, HealthConfig, ProjectEntry, DEV_KEY};
pub use orchestrator::OrchestratorConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Load configuration from a TOML file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a TOML file, creating parent directories as needed
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");

        let mut config = DaemonConfig::default();
        config.base_port = 5200;
        config.projects.push(ProjectEntry {
            name: "api".to_string(),
            directory: PathBuf::from("/work/api"),
        });

        save_config(&path, &config).unwrap();
        let loaded: DaemonConfig = load_config(&path).unwrap();

        assert_eq!(loaded.base_port, 5200);
        assert_eq!(loaded.projects.len(), 1);
        assert_eq!(loaded.projects[0].name, "api");
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<DaemonConfig, _> = load_config(Path::new("/nonexistent/t.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
