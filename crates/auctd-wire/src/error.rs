//! Error types for auctd-wire.

use thiserror::Error;

/// Wire protocol error types.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Malformed time header: {0}")]
    MalformedTime(String),

    #[error("Empty message frame")]
    EmptyFrame,

    #[error("Frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wire operations.
pub type WireResult<T> = std::result::Result<T, WireError>;
