//! Tether daemon library
//!
//! The daemon owns the local agent processes (spawned or attached),
//! probes their health, and keeps a single outbound tunnel to the
//! orchestrator over which HTTP-shaped requests are proxied in.

pub mod agent;
pub mod health;
pub mod projects;
pub mod proxy;
pub mod sync;
pub mod tunnel;

pub use projects::ProjectManager;
pub use tunnel::Relay;
