//! Global orchestrator state

use std::sync::Arc;

use tether_core::config::OrchestratorConfig;
use tether_core::events::EventBus;

use crate::auth::DeviceKeyStore;
use crate::connection::DaemonConnection;
use crate::pairing::PairingManager;
use crate::store::MessageStore;
use crate::sync::SyncCoordinator;

/// Everything the HTTP handlers and the tunnel share
pub struct OrchestratorState {
    /// Configuration
    pub config: OrchestratorConfig,
    /// The single daemon tunnel slot
    pub connection: Arc<DaemonConnection>,
    /// Session message cache
    pub store: Arc<MessageStore>,
    /// Backfill and event ingestion
    pub sync: Arc<SyncCoordinator>,
    /// Pending pairing code
    pub pairing: Arc<PairingManager>,
    /// Issued device keys
    pub keys: Arc<DeviceKeyStore>,
    /// Internal event distribution
    pub events: Arc<EventBus>,
}

impl OrchestratorState {
    pub fn new(config: OrchestratorConfig) -> Self {
        let connection = Arc::new(DaemonConnection::new(config.command_timeout));
        let store = Arc::new(MessageStore::new());
        let events = Arc::new(EventBus::new());
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&connection),
            Arc::clone(&store),
            Arc::clone(&events),
        ));
        let pairing = Arc::new(PairingManager::new(config.pairing_ttl));
        let keys = Arc::new(DeviceKeyStore::load(config.device_key_store_path.clone()));

        Self {
            config,
            connection,
            store,
            sync,
            pairing,
            keys,
            events,
        }
    }

    /// Whether a bearer token may open the tunnel or call the API
    pub fn token_allowed(&self, token: &str) -> bool {
        token == self.config.dev_key || self.keys.verify(token)
    }
}
