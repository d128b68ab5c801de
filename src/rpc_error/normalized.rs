//! Server-side canonical error.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::ErrorKind;
use crate::error::LinkwireError;

/// Boxed error accepted wherever arbitrary failures are coerced.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Canonical error produced at the failure site.
///
/// The `cause` stays on the server: it is logged by the engine and only
/// appears on the wire as a stack when dev mode is enabled. Extensions are
/// copied into the default shape's `data` object.
#[derive(Clone, thiserror::Error)]
#[error("{message}")]
pub struct NormalizedError {
    kind: ErrorKind,
    message: String,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
    extensions: Map<String, Value>,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            extensions: Map::new(),
        }
    }

    /// Error whose message is the kind's wire name.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.as_str())
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "Operation aborted")
    }

    /// Coerce an arbitrary error into an `Internal` error carrying it as cause.
    ///
    /// The message is taken from the error's display output, falling back to
    /// the kind name when that is empty.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::from_boxed(Box::new(error))
    }

    /// Like [`from_error`](Self::from_error) but unwraps a boxed
    /// `NormalizedError` instead of nesting it.
    pub fn from_boxed(error: BoxError) -> Self {
        match error.downcast::<NormalizedError>() {
            Ok(normalized) => *normalized,
            Err(other) => {
                let message = other.to_string();
                let message = if message.is_empty() {
                    ErrorKind::Internal.as_str().to_string()
                } else {
                    message
                };
                Self::internal(message).with_cause_arc(Arc::from(other))
            }
        }
    }

    /// Attach the underlying cause.
    pub fn with_cause<E>(self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.with_cause_arc(Arc::new(cause))
    }

    fn with_cause_arc(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Add a key to the shape extensions.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn extensions(&self) -> &Map<String, Value> {
        &self.extensions
    }

    /// Textual trace: the error followed by its cause chain.
    pub fn stack(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        let mut next: Option<&(dyn StdError + 'static)> = match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        };
        while let Some(err) = next {
            out.push_str("\n    caused by: ");
            out.push_str(&err.to_string());
            next = err.source();
        }
        out
    }
}

impl fmt::Debug for NormalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl From<LinkwireError> for NormalizedError {
    fn from(err: LinkwireError) -> Self {
        match err {
            LinkwireError::Aborted => Self::aborted(),
            other => Self::from_error(other),
        }
    }
}

impl From<serde_json::Error> for NormalizedError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(err)
    }
}

impl From<std::io::Error> for NormalizedError {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(err)
    }
}
