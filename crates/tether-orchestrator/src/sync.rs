//! Reconnect backfill and live event ingestion
//!
//! One coordinator sits between the tunnel and the message cache. On
//! every new daemon connection it asks for a backfill of the sessions it
//! already knows; while connected it folds live `event` frames into the
//! cache and republishes them for clients.

use std::sync::Arc;

use serde_json::Value;

use tether_core::events::{BusEvent, EventBus};
use tether_protocol::{EventPayload, Frame, SessionSync};

use crate::connection::DaemonConnection;
use crate::store::MessageStore;

pub struct SyncCoordinator {
    connection: Arc<DaemonConnection>,
    store: Arc<MessageStore>,
    events: Arc<EventBus>,
}

impl SyncCoordinator {
    pub fn new(
        connection: Arc<DaemonConnection>,
        store: Arc<MessageStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            connection,
            store,
            events,
        }
    }

    /// Ask the daemon to backfill everything we have cached. Called once
    /// per new tunnel connection.
    pub fn on_connected(&self) {
        let cached_session_ids = self.store.session_ids();
        let last_event_timestamp = self.store.last_event_timestamp();
        tracing::info!(
            "Requesting backfill for {} cached sessions",
            cached_session_ids.len()
        );
        if let Err(e) = self.connection.send(Frame::SyncRequest {
            cached_session_ids,
            last_event_timestamp,
        }) {
            tracing::warn!("Failed to send sync request: {}", e);
        }
    }

    /// Fold a backfill answer into the cache. Each merged message is
    /// re-broadcast once, in arrival order, so observers that stayed
    /// attached through the outage see the backfilled content.
    pub fn apply(&self, sessions: Vec<SessionSync>) {
        let count = sessions.len();
        for session in sessions {
            self.store.merge_session(&session.id, session.messages.clone());
            for message in session.messages {
                self.events.publish(BusEvent::new(
                    "message.updated",
                    serde_json::json!({ "sessionId": session.id.clone(), "info": message }),
                ));
            }
            self.events.publish(BusEvent::new(
                "session.synced",
                serde_json::json!({ "sessionId": session.id }),
            ));
        }
        tracing::info!("Backfill applied for {} sessions", count);
    }

    /// Fold one live event into the cache and republish it
    pub fn on_event(&self, event: EventPayload, timestamp: u64) {
        self.store.record_event_timestamp(timestamp);

        if let Some((session_id, message)) = extract_message(&event.data) {
            self.store.upsert(&session_id, message);
        }

        self.events.publish(BusEvent {
            kind: event.kind,
            data: event.data,
            timestamp,
        });
    }
}

/// Pull a (session id, message body) pair out of an agent event, if the
/// event describes a message update. Agents nest the message under
/// `properties.info` or `info`, with the session id inside it.
fn extract_message(data: &Value) -> Option<(String, Value)> {
    let info = data
        .get("properties")
        .and_then(|p| p.get("info"))
        .or_else(|| data.get("info"))?;
    let session_id = info
        .get("sessionID")
        .or_else(|| info.get("sessionId"))
        .and_then(Value::as_str)?;
    Some((session_id.to_string(), info.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn coordinator() -> (SyncCoordinator, mpsc::UnboundedReceiver<Frame>, Arc<MessageStore>) {
        let connection = Arc::new(DaemonConnection::new(Duration::from_secs(120)));
        let (tx, rx) = mpsc::unbounded_channel();
        connection.attach(tx);
        let store = Arc::new(MessageStore::new());
        let events = Arc::new(EventBus::new());
        (
            SyncCoordinator::new(connection, Arc::clone(&store), events),
            rx,
            store,
        )
    }

    #[tokio::test]
    async fn test_on_connected_requests_cached_sessions() {
        let (sync, mut rx, store) = coordinator();
        store.upsert("s1", json!({"id": "m1"}));
        store.record_event_timestamp(42);

        sync.on_connected();

        let Frame::SyncRequest {
            cached_session_ids,
            last_event_timestamp,
        } = rx.recv().await.unwrap()
        else {
            panic!("expected sync_request");
        };
        assert_eq!(cached_session_ids, vec!["s1"]);
        assert_eq!(last_event_timestamp, 42);
    }

    #[tokio::test]
    async fn test_apply_merges_backfill() {
        let (sync, _rx, store) = coordinator();
        store.upsert("s1", json!({"id": "m1", "text": "stale"}));

        sync.apply(vec![SessionSync {
            id: "s1".to_string(),
            messages: vec![
                json!({"id": "m1", "text": "fresh", "completed": true}),
                json!({"id": "m2", "text": "new"}),
            ],
        }]);

        let messages = store.messages("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["text"], "fresh");
    }

    #[tokio::test]
    async fn test_apply_rebroadcasts_each_merged_message() {
        let connection = Arc::new(DaemonConnection::new(Duration::from_secs(120)));
        let store = Arc::new(MessageStore::new());
        let events = Arc::new(EventBus::new());
        let sync = SyncCoordinator::new(connection, store, Arc::clone(&events));
        let (_id, mut observer) = events.subscribe();

        sync.apply(vec![SessionSync {
            id: "s1".to_string(),
            messages: vec![json!({"id": "m1", "text": "a"}), json!({"id": "m2", "text": "b"})],
        }]);

        // Every backfilled message goes out, in arrival order
        let first = observer.recv().await.unwrap();
        assert_eq!(first.kind, "message.updated");
        assert_eq!(first.data["sessionId"], "s1");
        assert_eq!(first.data["info"]["id"], "m1");

        let second = observer.recv().await.unwrap();
        assert_eq!(second.kind, "message.updated");
        assert_eq!(second.data["info"]["id"], "m2");

        let marker = observer.recv().await.unwrap();
        assert_eq!(marker.kind, "session.synced");
    }

    #[tokio::test]
    async fn test_event_updates_cache_and_timestamp() {
        let (sync, _rx, store) = coordinator();

        sync.on_event(
            EventPayload {
                kind: "message.updated".to_string(),
                data: json!({
                    "properties": {
                        "info": {"id": "m1", "sessionID": "s9", "text": "hi"}
                    }
                }),
            },
            1_700_000_000_000,
        );

        assert_eq!(store.last_event_timestamp(), 1_700_000_000_000);
        let messages = store.messages("s9").unwrap();
        assert_eq!(messages[0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_non_message_event_only_advances_clock() {
        let (sync, _rx, store) = coordinator();

        sync.on_event(
            EventPayload {
                kind: "server.heartbeat".to_string(),
                data: json!({}),
            },
            5,
        );

        assert_eq!(store.last_event_timestamp(), 5);
        assert!(store.session_ids().is_empty());
    }
}
