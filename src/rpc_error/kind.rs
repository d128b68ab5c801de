//! Error taxonomy shared by server and client.

use serde::{Deserialize, Serialize};

/// Stable classification of every error a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Request body could not be parsed.
    ParseError,
    /// Input rejected by the validator.
    BadInput,
    /// Caller is not authenticated.
    Unauthorized,
    /// Caller is authenticated but not allowed.
    Forbidden,
    /// No procedure at the requested path.
    NotFound,
    /// Procedure exists but not for this operation type or transport.
    MethodNotSupported,
    /// Procedure did not finish in time.
    Timeout,
    /// State conflict reported by the procedure.
    Conflict,
    /// Request exceeds configured limits.
    PayloadTooLarge,
    /// Too many concurrent or buffered requests.
    TooManyRequests,
    /// Operation was cancelled.
    Aborted,
    /// Uncaught handler failure or contract violation.
    #[serde(rename = "INTERNAL_SERVER_ERROR")]
    Internal,
    /// Client-side network/parse failure before a server error was received.
    TransportFailure,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 13] = [
        ErrorKind::ParseError,
        ErrorKind::BadInput,
        ErrorKind::Unauthorized,
        ErrorKind::Forbidden,
        ErrorKind::NotFound,
        ErrorKind::MethodNotSupported,
        ErrorKind::Timeout,
        ErrorKind::Conflict,
        ErrorKind::PayloadTooLarge,
        ErrorKind::TooManyRequests,
        ErrorKind::Aborted,
        ErrorKind::Internal,
        ErrorKind::TransportFailure,
    ];

    /// HTTP-like status code.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ParseError | ErrorKind::BadInput => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotSupported => 405,
            ErrorKind::Timeout => 408,
            ErrorKind::Conflict => 409,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::Aborted => 499,
            ErrorKind::Internal => 500,
            ErrorKind::TransportFailure => 502,
        }
    }

    /// JSON-RPC 2.0 style numeric code.
    pub fn rpc_code(self) -> i32 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::BadInput => -32600,
            ErrorKind::Unauthorized => -32001,
            ErrorKind::Forbidden => -32003,
            ErrorKind::NotFound => -32004,
            ErrorKind::MethodNotSupported => -32005,
            ErrorKind::Timeout => -32008,
            ErrorKind::Conflict => -32009,
            ErrorKind::PayloadTooLarge => -32013,
            ErrorKind::TooManyRequests => -32029,
            ErrorKind::Aborted => -32099,
            ErrorKind::Internal => -32603,
            ErrorKind::TransportFailure => -32000,
        }
    }

    /// Wire name, e.g. `"BAD_INPUT"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::BadInput => "BAD_INPUT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorKind::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::Internal => "INTERNAL_SERVER_ERROR",
            ErrorKind::TransportFailure => "TRANSPORT_FAILURE",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Reverse lookup of [`rpc_code`](Self::rpc_code).
    pub fn from_rpc_code(code: i64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| i64::from(k.rpc_code()) == code)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
