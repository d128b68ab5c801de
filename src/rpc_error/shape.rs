//! Wire shape of errors and the formatter hook.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::NormalizedError;
use crate::envelope::ProcedureKind;

/// Everything a formatter can look at.
pub struct FormatterInput<'a> {
    /// The error being shaped.
    pub error: &'a NormalizedError,
    /// The default shape, already built.
    pub shape: Value,
    /// Procedure path, when the failure happened after routing.
    pub path: Option<&'a str>,
    /// Procedure kind, when known.
    pub kind: Option<ProcedureKind>,
}

/// Re-shapes an error once before it is serialized.
///
/// Whatever the formatter returns is written to the wire verbatim.
pub trait ErrorFormatter: Send + Sync {
    fn format(&self, input: FormatterInput<'_>) -> Value;
}

impl<F> ErrorFormatter for F
where
    F: Fn(FormatterInput<'_>) -> Value + Send + Sync,
{
    fn format(&self, input: FormatterInput<'_>) -> Value {
        self(input)
    }
}

/// Formatter returning the default shape unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorFormatter;

impl ErrorFormatter for DefaultErrorFormatter {
    fn format(&self, input: FormatterInput<'_>) -> Value {
        input.shape
    }
}

/// Shared formatter handle.
pub type SharedFormatter = Arc<dyn ErrorFormatter>;

/// Build the default shape:
///
/// ```text
/// { "message", "code": <rpc code>, "data": { "code": <KIND>, "httpStatus", "path"?, "stack"?, ...extensions } }
/// ```
pub fn default_shape(error: &NormalizedError, path: Option<&str>, is_dev: bool) -> Value {
    let mut data = Map::new();
    for (key, value) in error.extensions() {
        data.insert(key.clone(), value.clone());
    }
    data.insert("code".into(), Value::from(error.kind().as_str()));
    data.insert("httpStatus".into(), Value::from(error.http_status()));
    if let Some(path) = path {
        data.insert("path".into(), Value::from(path));
    }
    if is_dev {
        data.insert("stack".into(), Value::from(error.stack()));
    }

    json!({
        "message": error.message(),
        "code": error.kind().rpc_code(),
        "data": Value::Object(data),
    })
}

/// Build the default shape and pass it through `formatter`.
pub fn format_error(
    formatter: &dyn ErrorFormatter,
    error: &NormalizedError,
    path: Option<&str>,
    kind: Option<ProcedureKind>,
    is_dev: bool,
) -> Value {
    let shape = default_shape(error, path, is_dev);
    formatter.format(FormatterInput {
        error,
        shape,
        path,
        kind,
    })
}
