//! Outbound tunnel to the orchestrator

mod backoff;
mod relay;

pub use backoff::ReconnectBackoff;
pub use relay::Relay;
