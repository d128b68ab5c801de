//! Error types for linkwire.
//!
//! [`LinkwireError`] covers faults of the plumbing itself: I/O, codecs,
//! framing, connection loss and router composition. Errors produced by
//! procedures live in [`crate::rpc_error`].

use thiserror::Error;

/// Main error type for transport, codec and composition failures.
#[derive(Debug, Error)]
pub enum LinkwireError {
    /// I/O error during socket or stream operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed frame, truncated batch stream, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A transformer rejected a value.
    #[error("Transformer error: {0}")]
    Transform(String),

    /// Two procedures were registered under the same path.
    #[error("Duplicate procedure path: {0}")]
    DuplicatePath(String),

    /// A procedure path is empty or has malformed segments.
    #[error("Invalid procedure path: {0:?}")]
    InvalidPath(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The request was aborted through its cancellation token.
    #[error("Request aborted")]
    Aborted,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using LinkwireError.
pub type Result<T> = std::result::Result<T, LinkwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            LinkwireError::DuplicatePath("user.get".into()).to_string(),
            "Duplicate procedure path: user.get"
        );
        assert_eq!(
            LinkwireError::InvalidPath("a..b".into()).to_string(),
            "Invalid procedure path: \"a..b\""
        );
        assert_eq!(LinkwireError::ConnectionClosed.to_string(), "Connection closed");
    }

    #[test]
    fn test_from_io() {
        let err: LinkwireError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, LinkwireError::Io(_)));
    }
}
