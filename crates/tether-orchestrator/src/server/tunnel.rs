//! The daemon tunnel endpoint
//!
//! One WebSocket per daemon. The socket is split: a writer task drains an
//! unbounded frame channel, the read loop dispatches inbound frames, and
//! teardown detaches the connection slot under its generation so a
//! superseded socket cannot tear down its replacement.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use tether_core::events::BusEvent;
use tether_protocol::{decode, encode, Frame};

use crate::OrchestratorState;

pub async fn tunnel_handler(
    State(state): State<Arc<OrchestratorState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<OrchestratorState>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let generation = state.connection.attach(tx);
    tracing::info!("Daemon tunnel attached (generation {})", generation);

    // Writer task: drain outbound frames onto the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match encode(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode {} frame: {}", frame.type_name(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Every reconnect starts with a backfill request
    state.sync.on_connected();

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match decode(&text) {
                Ok(frame) => handle_frame(&state, frame, generation),
                Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Tunnel read failed: {}", e);
                break;
            }
        }
    }

    state.connection.detach(generation);
    state.pairing.handle_disconnect(generation);
    writer.abort();
    tracing::info!("Daemon tunnel closed (generation {})", generation);
}

fn handle_frame(state: &Arc<OrchestratorState>, frame: Frame, generation: u64) {
    match frame {
        Frame::Status {
            all_ready,
            projects,
        } => {
            tracing::info!(
                "Daemon status: {} projects, all_ready={}",
                projects.len(),
                all_ready
            );
            state.connection.update_status(all_ready, projects);
            state.events.publish(BusEvent::new(
                "daemon.status",
                serde_json::json!({ "allReady": all_ready }),
            ));
        }

        Frame::Heartbeat { timestamp } => {
            if let Err(e) = state.connection.send(Frame::HeartbeatAck { timestamp }) {
                tracing::warn!("Failed to ack heartbeat: {}", e);
            }
        }

        Frame::HttpResponse {
            request_id,
            status,
            body,
        } => state.connection.resolve(&request_id, status, body),

        Frame::Event { event, timestamp } => state.sync.on_event(event, timestamp),

        Frame::SyncResponse { sessions } => state.sync.apply(sessions),

        Frame::PairRequest { pairing_code } => {
            if state.pairing.register(&pairing_code, generation) {
                // The earlier announcement is answered before it is
                // forgotten
                let _ = state.connection.send(Frame::PairResponse {
                    success: false,
                    device_key: None,
                    error: Some("replaced".to_string()),
                });
            }
            tracing::info!("Pairing code announced by daemon");
        }

        Frame::HeartbeatAck { .. } => {
            tracing::trace!("Unsolicited heartbeat ack");
        }

        Frame::Unknown => tracing::warn!("Dropping frame with unknown type"),

        other => tracing::warn!("Unexpected {} frame from daemon; dropping", other.type_name()),
    }
}
