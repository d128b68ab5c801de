//! Input/output schema checking.
//!
//! A [`Validator`] takes a raw value and returns the value the handler should
//! see (possibly normalized), or a [`ValidationError`]. Plain closures and
//! [`SerdeValidator`] cover most uses; implement the trait directly for
//! validators that need to await something.

use std::marker::PhantomData;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Validation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait Validator: Send + Sync + 'static {
    fn validate(&self, value: Value) -> BoxFuture<'static, Result<Value, ValidationError>>;
}

impl<F> Validator for F
where
    F: Fn(Value) -> Result<Value, ValidationError> + Send + Sync + 'static,
{
    fn validate(&self, value: Value) -> BoxFuture<'static, Result<Value, ValidationError>> {
        future::ready(self(value)).boxed()
    }
}

/// Uses a serde type as the schema.
///
/// The value is deserialized into `T` and serialized back, so unknown
/// fields are dropped and `#[serde(default)]` fields are filled in.
pub struct SerdeValidator<T> {
    _schema: PhantomData<fn() -> T>,
}

impl<T> SerdeValidator<T> {
    pub fn new() -> Self {
        Self {
            _schema: PhantomData,
        }
    }
}

impl<T> Default for SerdeValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for SerdeValidator<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    fn validate(&self, value: Value) -> BoxFuture<'static, Result<Value, ValidationError>> {
        let result = serde_json::from_value::<T>(value)
            .and_then(|parsed| serde_json::to_value(&parsed))
            .map_err(|e| ValidationError::new(e.to_string()));
        future::ready(result).boxed()
    }
}
