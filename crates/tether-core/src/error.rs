//! Relay error taxonomy
//!
//! Relay-layer failures are converted into structured response bodies and
//! travel back through the originating correlation id; they are never
//! allowed to take the tunnel task down. `status_code` gives the HTTP
//! mapping used at the orchestrator's client-facing surface.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad or missing tunnel token. Connection rejected, never downgraded.
    #[error("Authentication failed")]
    Auth,

    /// Command exceeded the correlation window
    #[error("Command timed out after {0} seconds")]
    Timeout(u64),

    /// Agent process unreachable or errored
    #[error("Bad gateway: {message}")]
    BadGateway { message: String },

    /// Unknown session, project, or pairing code
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate project name/directory or racing pairing registration
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No active tunnel to route through
    #[error("Daemon not connected")]
    Disconnected,

    /// Configuration error (fails fast at startup, never retried)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status used when this error reaches a client
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Auth => 401,
            RelayError::Timeout(_) => 504,
            RelayError::BadGateway { .. } => 502,
            RelayError::NotFound(_) => 404,
            RelayError::Conflict(_) => 409,
            RelayError::Disconnected => 503,
            RelayError::Config(_) | RelayError::Io(_) => 500,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RelayError::Auth.status_code(), 401);
        assert_eq!(RelayError::Timeout(120).status_code(), 504);
        assert_eq!(
            RelayError::BadGateway {
                message: "refused".into()
            }
            .status_code(),
            502
        );
        assert_eq!(RelayError::Disconnected.status_code(), 503);
        assert_eq!(RelayError::NotFound("s1".into()).status_code(), 404);
        assert_eq!(RelayError::Conflict("api".into()).status_code(), 409);
    }
}
