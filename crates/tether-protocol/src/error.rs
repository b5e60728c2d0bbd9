//! Protocol error types

use thiserror::Error;

/// Errors produced while encoding or decoding tunnel frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match any known shape
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame exceeded the maximum allowed size
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}
