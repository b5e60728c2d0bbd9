//! End-to-end relay tests with a scripted daemon on the far side of the
//! connection slot.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use tether_core::config::OrchestratorConfig;
use tether_core::RelayError;
use tether_orchestrator::pairing::PairingVerdict;
use tether_orchestrator::OrchestratorState;
use tether_protocol::{Frame, SessionSync};

fn test_state() -> (Arc<OrchestratorState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::default();
    config.command_timeout = Duration::from_millis(200);
    config.device_key_store_path = dir.path().join("device_keys.toml");
    (Arc::new(OrchestratorState::new(config)), dir)
}

/// Attach a scripted daemon that answers every relayed request with the
/// given status and body.
fn attach_scripted_daemon(
    state: &Arc<OrchestratorState>,
    status: u16,
    body: serde_json::Value,
) -> u64 {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let generation = state.connection.attach(tx);

    let state = Arc::clone(state);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Frame::HttpRequest { request_id, .. } = frame {
                state.connection.resolve(&request_id, status, body.clone());
            }
        }
    });

    generation
}

#[tokio::test]
async fn test_command_round_trip() {
    let (state, _dir) = test_state();
    attach_scripted_daemon(&state, 200, json!([{"id": "s1", "title": "fix tests"}]));

    let outcome = state
        .connection
        .send_command("GET", "/sessions", None, None)
        .await
        .unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body[0]["id"], "s1");
}

#[tokio::test]
async fn test_command_without_daemon_is_rejected() {
    let (state, _dir) = test_state();

    let result = state
        .connection
        .send_command("GET", "/sessions", None, None)
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, RelayError::Disconnected));
    assert_eq!(err.status_code(), 503);
    assert_eq!(err.to_string(), "Daemon not connected");
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let (state, _dir) = test_state();
    // Attach a daemon that never answers
    let (tx, _rx) = mpsc::unbounded_channel::<Frame>();
    state.connection.attach(tx);

    let result = state
        .connection
        .send_command("POST", "/sessions/s1/prompt", None, Some(json!({"text": "go"})))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)));
    assert_eq!(err.status_code(), 504);
}

#[tokio::test]
async fn test_new_tunnel_supersedes_and_fails_in_flight() {
    let (state, _dir) = test_state();
    let (tx1, _rx1) = mpsc::unbounded_channel::<Frame>();
    let old_generation = state.connection.attach(tx1);

    let pending = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            state
                .connection
                .send_command("GET", "/sessions", None, None)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Reconnect: the in-flight command fails, the new tunnel works
    attach_scripted_daemon(&state, 200, json!({"ok": true}));
    assert!(matches!(
        pending.await.unwrap(),
        Err(RelayError::Disconnected)
    ));

    // The superseded socket's teardown must not detach the new tunnel
    state.connection.detach(old_generation);
    assert!(state.connection.is_connected());

    let outcome = state
        .connection
        .send_command("GET", "/health", None, None)
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
}

#[tokio::test]
async fn test_pairing_lifecycle_mints_usable_key() {
    let (state, _dir) = test_state();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let generation = state.connection.attach(tx);

    // Daemon announces a code over its tunnel
    state.pairing.register("PAIR42", generation);

    // Client enters the code
    assert_eq!(state.pairing.verify("PAIR42"), PairingVerdict::Verified);
    let key = state.keys.mint("u1").unwrap();
    state
        .connection
        .send(Frame::PairResponse {
            success: true,
            device_key: Some(key.as_str().to_string()),
            error: None,
        })
        .unwrap();

    // Daemon receives the minted key and it authenticates from then on
    let Frame::PairResponse {
        success,
        device_key,
        ..
    } = rx.recv().await.unwrap()
    else {
        panic!("expected pair_response");
    };
    assert!(success);
    let device_key = device_key.unwrap();
    assert!(state.token_allowed(&device_key));
    assert!(!state.token_allowed("dk_forged"));

    // The code is single-use
    assert_eq!(
        state.pairing.verify("PAIR42"),
        PairingVerdict::NoPendingPairing
    );
}

#[tokio::test]
async fn test_pairing_dies_with_its_tunnel() {
    let (state, _dir) = test_state();
    let (tx, _rx) = mpsc::unbounded_channel::<Frame>();
    let generation = state.connection.attach(tx);

    state.pairing.register("PAIR42", generation);
    state.connection.detach(generation);
    state.pairing.handle_disconnect(generation);

    assert_eq!(
        state.pairing.verify("PAIR42"),
        PairingVerdict::NoPendingPairing
    );
}

#[tokio::test]
async fn test_reconnect_backfill_merges_into_cache() {
    let (state, _dir) = test_state();
    state.store.upsert("s1", json!({"id": "m1", "text": "old"}));

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    state.connection.attach(tx);
    state.sync.on_connected();

    // The daemon sees the cached ids in the request
    let Frame::SyncRequest {
        cached_session_ids, ..
    } = rx.recv().await.unwrap()
    else {
        panic!("expected sync_request");
    };
    assert_eq!(cached_session_ids, vec!["s1"]);

    // Its answer merges in place; replaying it changes nothing
    let sessions = vec![SessionSync {
        id: "s1".to_string(),
        messages: vec![
            json!({"id": "m1", "text": "new", "completed": true}),
            json!({"id": "m2", "text": "tail"}),
        ],
    }];
    state.sync.apply(sessions.clone());
    state.sync.apply(sessions);

    let messages = state.store.messages("s1").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["text"], "new");
    assert_eq!(messages[1]["text"], "tail");
}

#[tokio::test]
async fn test_dev_key_allowed_until_replaced() {
    let (state, _dir) = test_state();
    assert!(state.token_allowed(&state.config.dev_key));
    assert!(!state.token_allowed(""));
}
