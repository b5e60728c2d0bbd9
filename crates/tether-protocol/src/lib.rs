//! Wire protocol for the tether tunnel.
//!
//! The daemon and orchestrator exchange JSON frames over a single
//! WebSocket connection, one object per text frame. Every frame carries a
//! `type` discriminator; see [`Frame`] for the full set.

mod error;
mod frame;

pub use error::ProtocolError;
pub use frame::{
    decode, encode, EventPayload, Frame, HttpQuery, ProjectStatus, SessionSync, MAX_FRAME_SIZE,
};
