//! Codec error types.

use thiserror::Error;

/// Errors produced while framing or unframing messages.
///
/// Any variant other than `Closed` is a protocol violation and the session
/// carrying the stream must be terminated.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Peer closed the stream cleanly between frames.
    #[error("connection closed by peer")]
    Closed,

    /// Stream ended in the middle of a frame.
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// Length header was not 10 ASCII decimal digits.
    #[error("malformed length header: {0:?}")]
    BadHeader(String),

    /// Declared body length exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Body was not the expected JSON object shape.
    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
