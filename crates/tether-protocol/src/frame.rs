//! Tunnel frame types
//!
//! Frames are JSON objects tagged by a `type` field. Unknown types decode
//! into [`Frame::Unknown`] so that a newer peer never breaks an older one;
//! receivers log and drop that arm rather than erroring.
//!
//! # Frame Flow
//!
//! Typical sequence over one tunnel connection:
//!
//! 1. Daemon connects (bearer token on the upgrade) and sends `status`
//! 2. Orchestrator immediately sends `sync_request`; daemon answers with
//!    `sync_response`
//! 3. Daemon sends `heartbeat` periodically, orchestrator answers
//!    `heartbeat_ack`
//! 4. Client traffic arrives as `http_request` / `http_response` pairs
//!    correlated by `requestId`
//! 5. Agent activity streams up as `event` frames
//! 6. Pairing rides the same tunnel as `pair_request` / `pair_response`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Maximum accepted frame size in bytes.
///
/// Agent message bodies can be large (full session transcripts in a
/// `sync_response`), so the cap is generous; it exists to bound memory on
/// a misbehaving peer, not to constrain normal traffic.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Query parameters for a proxied HTTP request.
///
/// A sorted map keeps encoded frames stable, which matters only for tests
/// and log diffing.
pub type HttpQuery = BTreeMap<String, String>;

/// Readiness of one project, reported in `status` frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    /// Project name
    pub name: String,
    /// Whether the project's agent process is ready to serve
    pub ready: bool,
}

/// An out-of-band event forwarded from an agent process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event type as reported by the agent
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque event data
    pub data: Value,
}

/// Per-session backfill payload inside a `sync_response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSync {
    /// Session id
    pub id: String,
    /// Messages in original arrival order. Opaque agent JSON; each carries
    /// at least an `id` field and may carry a `completed` marker.
    pub messages: Vec<Value>,
}

/// Tunnel frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Daemon readiness declaration, sent on connect and on change
    #[serde(rename_all = "camelCase")]
    Status {
        /// True only when every tracked project is ready
        all_ready: bool,
        /// Per-project readiness
        projects: Vec<ProjectStatus>,
    },

    /// Liveness ping
    Heartbeat {
        /// Sender clock, milliseconds since epoch
        timestamp: u64,
    },

    /// Liveness reply
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// HTTP-shaped request relayed from a client, orchestrator to daemon
    #[serde(rename_all = "camelCase")]
    HttpRequest {
        /// Correlation id, echoed in the matching `http_response`
        request_id: String,
        /// HTTP method
        method: String,
        /// Request path on the agent process
        path: String,
        /// Query parameters
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<HttpQuery>,
        /// JSON body
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },

    /// Result of a relayed request, daemon to orchestrator
    #[serde(rename_all = "camelCase")]
    HttpResponse {
        /// Correlation id from the originating `http_request`
        request_id: String,
        /// HTTP status from the agent process (or synthesized 502)
        status: u16,
        /// Response body
        body: Value,
    },

    /// Agent activity forwarded out-of-band, daemon to orchestrator
    Event {
        /// The event itself
        event: EventPayload,
        /// Daemon clock at forwarding time, milliseconds since epoch
        timestamp: u64,
    },

    /// Backfill request sent by the orchestrator on every new connection
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        /// All session ids currently present in the orchestrator's store
        cached_session_ids: Vec<String>,
        /// Timestamp of the most recently observed event, or 0
        last_event_timestamp: u64,
    },

    /// Backfill answer, one entry per requested session
    SyncResponse {
        /// Fresh per-session message lists
        sessions: Vec<SessionSync>,
    },

    /// Pairing code announcement, daemon to orchestrator
    #[serde(rename_all = "camelCase")]
    PairRequest {
        /// Short-lived code the user will enter in the UI
        pairing_code: String,
    },

    /// Pairing outcome, orchestrator to daemon
    #[serde(rename_all = "camelCase")]
    PairResponse {
        /// Whether pairing succeeded
        success: bool,
        /// Minted device key on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_key: Option<String>,
        /// Failure reason otherwise
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Any frame with an unrecognized `type`. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Wire name of this frame's type, for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Status { .. } => "status",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::HeartbeatAck { .. } => "heartbeat_ack",
            Frame::HttpRequest { .. } => "http_request",
            Frame::HttpResponse { .. } => "http_response",
            Frame::Event { .. } => "event",
            Frame::SyncRequest { .. } => "sync_request",
            Frame::SyncResponse { .. } => "sync_response",
            Frame::PairRequest { .. } => "pair_request",
            Frame::PairResponse { .. } => "pair_response",
            Frame::Unknown => "unknown",
        }
    }
}

/// Encode a frame as a JSON string for a WebSocket text message
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from the payload of a WebSocket text message
pub fn decode(payload: &str) -> Result<Frame, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(payload)?)
}
