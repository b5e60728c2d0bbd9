//! Client-facing HTTP surface and the tunnel endpoint

mod api;
mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::OrchestratorState;

/// Build the router. Everything except pairing verification requires a
/// bearer token; `/pair/verify` is how a client without a key gets one
/// accepted in the first place.
pub fn router(state: Arc<OrchestratorState>) -> Router {
    let public = Router::new().route("/pair/verify", post(api::pair_verify));

    let authed = Router::new()
        .route("/status", get(api::status))
        .route("/tunnel", get(tunnel::tunnel_handler))
        .fallback(api::relay)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ));

    public.merge(authed).with_state(state)
}

/// Bind and serve until cancelled
pub async fn serve(
    state: Arc<OrchestratorState>,
    bind_address: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Server error")?;

    Ok(())
}

async fn require_bearer(
    State(state): State<Arc<OrchestratorState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| state.token_allowed(token))
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Authentication failed"})),
        )
            .into_response()
    }
}
