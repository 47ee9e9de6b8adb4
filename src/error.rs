//! Error types for fleetwire.

use thiserror::Error;

/// Main error type for all fleetwire operations.
#[derive(Debug, Error)]
pub enum FleetwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection (end of stream).
    ///
    /// Distinct from [`FleetwireError::Io`]: a serving loop treats this
    /// as a clean shutdown, not a failure.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol error (bad length field, embedded separator, unknown
    /// status byte, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A user handler failed; the text is surfaced to the peer as the
    /// content of an error-status response.
    #[error("{0}")]
    Handler(String),
}

/// Result type alias using FleetwireError.
pub type Result<T> = std::result::Result<T, FleetwireError>;
