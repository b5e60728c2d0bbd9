//! Shared building blocks for the tether daemon and orchestrator.
//!
//! This crate carries everything both sides need but neither owns:
//! configuration loading, the relay error taxonomy, id newtypes, the
//! event pub-sub registry, and clock helpers.

pub mod config;
pub mod error;
pub mod events;
pub mod time;
pub mod types;

pub use error::{ConfigError, RelayError};
pub use types::{DeviceKey, ProjectName, RequestId, SessionId};
