//! Client-side reconstruction of errors.

use serde_json::Value;

use super::ErrorKind;
use crate::error::LinkwireError;

/// Where a [`ClientError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// The server answered with an error shape.
    Server,
    /// The server could not be reached or its answer could not be parsed.
    Transport,
    /// Raised locally (cancellation, misconfigured link chain).
    Client,
}

/// Typed error delivered to callers.
///
/// Server errors keep the formatted shape verbatim, so anything a formatter
/// added is reachable through [`shape`](Self::shape) and
/// [`data`](Self::data).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
    http_status: u16,
    shape: Option<Value>,
    origin: ErrorOrigin,
}

impl ClientError {
    /// Reconstruct from a server error shape.
    ///
    /// The kind is read from `data.code`, then from the numeric `code`, and
    /// defaults to `Internal`.
    pub fn from_shape(shape: Value) -> Self {
        let message = shape
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();

        let data = shape.get("data");
        let kind = data
            .and_then(|d| d.get("code"))
            .and_then(Value::as_str)
            .and_then(ErrorKind::from_name)
            .or_else(|| {
                shape
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(ErrorKind::from_rpc_code)
            })
            .unwrap_or(ErrorKind::Internal);

        let http_status = data
            .and_then(|d| d.get("httpStatus"))
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or_else(|| kind.http_status());

        Self {
            kind,
            message,
            http_status,
            shape: Some(shape),
            origin: ErrorOrigin::Server,
        }
    }

    /// Network or parse failure before a server error was received.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::local(ErrorKind::TransportFailure, message, ErrorOrigin::Transport)
    }

    /// The caller cancelled the operation.
    pub fn aborted() -> Self {
        Self::local(ErrorKind::Aborted, "Operation aborted", ErrorOrigin::Client)
    }

    /// Locally raised error of any kind.
    pub fn client(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::local(kind, message, ErrorOrigin::Client)
    }

    fn local(kind: ErrorKind, message: impl Into<String>, origin: ErrorOrigin) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: kind.http_status(),
            shape: None,
            origin,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn origin(&self) -> ErrorOrigin {
        self.origin
    }

    /// The formatted shape as sent by the server.
    pub fn shape(&self) -> Option<&Value> {
        self.shape.as_ref()
    }

    /// The shape's `data` object.
    pub fn data(&self) -> Option<&Value> {
        self.shape.as_ref().and_then(|s| s.get("data"))
    }

    /// A key from the shape's `data` object.
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.data().and_then(|d| d.get(key))
    }

    pub fn is_transport_failure(&self) -> bool {
        self.kind == ErrorKind::TransportFailure
    }
}

impl From<LinkwireError> for ClientError {
    fn from(err: LinkwireError) -> Self {
        match err {
            LinkwireError::Aborted => ClientError::aborted(),
            other => ClientError::transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_default_shape() {
        let shape = json!({
            "message": "boom",
            "code": -32003,
            "data": { "code": "FORBIDDEN", "httpStatus": 403, "reason": "X" }
        });
        let err = ClientError::from_shape(shape);

        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.message(), "boom");
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.extension("reason"), Some(&json!("X")));
        assert_eq!(err.origin(), ErrorOrigin::Server);
    }

    #[test]
    fn test_kind_falls_back_to_numeric_code() {
        let err = ClientError::from_shape(json!({ "message": "late", "code": -32008 }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.http_status(), 408);
    }

    #[test]
    fn test_unknown_shape_is_internal() {
        let err = ClientError::from_shape(json!({ "weird": true }));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "Unknown error");
    }

    #[test]
    fn test_transport_failure_is_distinct() {
        let err = ClientError::from(LinkwireError::ConnectionClosed);
        assert!(err.is_transport_failure());
        assert_eq!(err.origin(), ErrorOrigin::Transport);
        assert!(err.shape().is_none());
    }
}
