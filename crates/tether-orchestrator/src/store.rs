//! Session message cache
//!
//! The orchestrator keeps the last known messages for every session it
//! has seen, so clients get instant reads and a daemon reconnect only has
//! to backfill the delta. Messages are opaque agent JSON; the store keys
//! them by their `id` field and upserts in place, so replaying the same
//! event or backfill twice leaves the cache unchanged.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;

/// One cached message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Message id as reported by the agent, if it carried one
    pub id: Option<String>,
    /// The message body as last seen
    pub body: Value,
    /// True until the agent marks the message completed
    pub streaming: bool,
}

/// Cache of per-session message lists, in arrival order
pub struct MessageStore {
    sessions: DashMap<String, Vec<StoredMessage>>,
    last_event_timestamp: AtomicU64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            last_event_timestamp: AtomicU64::new(0),
        }
    }

    /// Insert or update one message. An existing message with the same id
    /// is overwritten in place, preserving its position; anything else is
    /// appended. Messages without an id are always appended.
    pub fn upsert(&self, session_id: &str, message: Value) {
        let id = message
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let streaming = !message
            .get("completed")
            .map(is_truthy)
            .unwrap_or(false);

        let mut messages = self.sessions.entry(session_id.to_string()).or_default();

        if let Some(id) = &id {
            if let Some(existing) = messages
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(id.as_str()))
            {
                existing.body = message;
                existing.streaming = streaming;
                return;
            }
        }

        messages.push(StoredMessage {
            id,
            body: message,
            streaming,
        });
    }

    /// Merge a full backfill list for one session
    pub fn merge_session(&self, session_id: &str, messages: Vec<Value>) {
        for message in messages {
            self.upsert(session_id, message);
        }
    }

    /// Cached message bodies for a session, in arrival order
    pub fn messages(&self, session_id: &str) -> Option<Vec<Value>> {
        self.sessions
            .get(session_id)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
    }

    /// Ids of messages still streaming in a session
    pub fn streaming_ids(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.streaming)
                    .filter_map(|m| m.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every session id the store has seen
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Note an observed event timestamp; only ever moves forward
    pub fn record_event_timestamp(&self, timestamp: u64) {
        self.last_event_timestamp
            .fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn last_event_timestamp(&self) -> u64 {
        self.last_event_timestamp.load(Ordering::SeqCst)
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        // Agents report completion as a timestamp in some versions
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_preserves_position() {
        let store = MessageStore::new();
        store.upsert("s1", json!({"id": "m1", "text": "a"}));
        store.upsert("s1", json!({"id": "m2", "text": "b"}));
        store.upsert("s1", json!({"id": "m1", "text": "a (edited)"}));

        let messages = store.messages("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["text"], "a (edited)");
        assert_eq!(messages[1]["text"], "b");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let store = MessageStore::new();
        let backfill = vec![
            json!({"id": "m1", "text": "a", "completed": true}),
            json!({"id": "m2", "text": "b"}),
        ];
        store.merge_session("s1", backfill.clone());
        store.merge_session("s1", backfill);

        assert_eq!(store.messages("s1").unwrap().len(), 2);
    }

    #[test]
    fn test_streaming_follows_completed_marker() {
        let store = MessageStore::new();
        store.upsert("s1", json!({"id": "m1", "text": "partial"}));
        assert_eq!(store.streaming_ids("s1"), vec!["m1"]);

        store.upsert("s1", json!({"id": "m1", "text": "done", "completed": true}));
        assert!(store.streaming_ids("s1").is_empty());
    }

    #[test]
    fn test_completed_timestamp_counts_as_done() {
        let store = MessageStore::new();
        store.upsert("s1", json!({"id": "m1", "completed": 1_700_000_000_000u64}));
        assert!(store.streaming_ids("s1").is_empty());
    }

    #[test]
    fn test_messages_without_id_always_append() {
        let store = MessageStore::new();
        store.upsert("s1", json!({"text": "x"}));
        store.upsert("s1", json!({"text": "x"}));
        assert_eq!(store.messages("s1").unwrap().len(), 2);
    }

    #[test]
    fn test_event_timestamp_only_advances() {
        let store = MessageStore::new();
        store.record_event_timestamp(100);
        store.record_event_timestamp(50);
        assert_eq!(store.last_event_timestamp(), 100);
    }
}
