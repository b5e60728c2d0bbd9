//! Client-facing HTTP handlers
//!
//! Apart from `/status` and pairing, every request is relayed to the
//! daemon as an `http_request` frame and answered with whatever comes
//! back on the matching correlation id. Cached session transcripts are
//! served locally so reads survive a daemon outage.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tether_core::RelayError;
use tether_protocol::{Frame, HttpQuery};

use crate::pairing::PairingVerdict;
use crate::OrchestratorState;

/// Local health view: tunnel state plus the daemon's last status report
pub async fn status(State(state): State<Arc<OrchestratorState>>) -> Response {
    let daemon = state.connection.status();
    Json(json!({
        "connected": state.connection.is_connected(),
        "allReady": daemon.all_ready,
        "projects": daemon.projects,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct PairVerifyBody {
    code: String,
    #[serde(rename = "userId")]
    user_id: String,
}

/// Verify a pairing code entered by a client. On success a device key is
/// minted for the caller and handed back; the daemon is notified over its
/// tunnel on a best-effort basis.
pub async fn pair_verify(
    State(state): State<Arc<OrchestratorState>>,
    Json(body): Json<PairVerifyBody>,
) -> Response {
    let verdict = state.pairing.verify(&body.code);
    if verdict != PairingVerdict::Verified {
        tracing::info!("Pairing verification failed: {}", verdict.as_error_str());
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": verdict.as_error_str()})),
        )
            .into_response();
    }

    let key = match state.keys.mint(&body.user_id) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!("Failed to mint device key: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": "Failed to mint device key"})),
            )
                .into_response();
        }
    };

    // The key is already minted and usable; a dropped tunnel only means
    // the daemon learns about it on its next pairing attempt.
    let delivered = state.connection.send(Frame::PairResponse {
        success: true,
        device_key: Some(key.as_str().to_string()),
        error: None,
    });
    if let Err(e) = delivered {
        tracing::warn!("Paired but could not notify the daemon: {}", e);
    }

    Json(json!({"success": true, "deviceKey": key.as_str()})).into_response()
}

/// Fallback handler: relay the request to the daemon.
///
/// `GET /sessions/:id/messages` is answered from the cache when the
/// session is known; everything else (and cache misses) goes down the
/// tunnel.
pub async fn relay(
    State(state): State<Arc<OrchestratorState>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HttpQuery>,
    body: Option<Json<Value>>,
) -> Response {
    let path = uri.path().to_string();

    if method == Method::GET {
        if let Some(session_id) = messages_path_session(&path) {
            if let Some(messages) = state.store.messages(session_id) {
                tracing::debug!("Serving cached messages for session {}", session_id);
                return Json(Value::Array(messages)).into_response();
            }
        }
    }

    let query = if query.is_empty() { None } else { Some(query) };
    let body = body.map(|Json(value)| value);

    match state
        .connection
        .send_command(method.as_str(), &path, query, body)
        .await
    {
        Ok(outcome) => {
            let status =
                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(outcome.body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Map a relay failure to its client-facing response
fn error_response(error: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

/// Extract the session id from `/sessions/:id/messages`
fn messages_path_session(path: &str) -> Option<&str> {
    let mut segments = path.trim_matches('/').split('/');
    match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some("sessions"), Some(id), Some("messages"), None) => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_path_extraction() {
        assert_eq!(
            messages_path_session("/sessions/abc/messages"),
            Some("abc")
        );
        assert_eq!(messages_path_session("/sessions/abc"), None);
        assert_eq!(messages_path_session("/sessions/abc/prompt"), None);
        assert_eq!(messages_path_session("/sessions/abc/messages/extra"), None);
        assert_eq!(messages_path_session("/health"), None);
    }
}
