//! tether-orchestrator: relay between clients and daemon tunnels
//!
//! The orchestrator accepts one authenticated WebSocket tunnel from a
//! daemon and an HTTP API from clients. Client requests are correlated
//! onto the tunnel as frames; agent activity streams back and is cached
//! so reconnecting clients and daemons only transfer deltas.

pub mod auth;
pub mod connection;
pub mod pairing;
pub mod server;
pub mod state;
pub mod store;
pub mod sync;

pub use connection::DaemonConnection;
pub use state::OrchestratorState;
