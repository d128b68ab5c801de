//! Value transformers applied to every input and result.
//!
//! The framing layer never looks inside values; transformers run on each
//! individual value before it is placed into an envelope and after it is
//! taken out of one.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

/// Encodes values that plain JSON cannot represent, and decodes them back.
pub trait Transformer: Send + Sync {
    /// Turn an in-memory value into its wire form.
    fn serialize(&self, value: Value) -> Result<Value>;

    /// Turn a wire value back into its in-memory form.
    fn deserialize(&self, value: Value) -> Result<Value>;
}

/// Pass-through transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    #[inline]
    fn serialize(&self, value: Value) -> Result<Value> {
        Ok(value)
    }

    #[inline]
    fn deserialize(&self, value: Value) -> Result<Value> {
        Ok(value)
    }
}

/// Separate transformers for the two directions.
///
/// `input` handles client → server values (operation inputs), `output`
/// handles server → client values (result data and error shapes).
#[derive(Clone)]
pub struct Transformers {
    pub input: Arc<dyn Transformer>,
    pub output: Arc<dyn Transformer>,
}

impl Transformers {
    /// Same transformer in both directions.
    pub fn uniform(transformer: impl Transformer + 'static) -> Self {
        let shared: Arc<dyn Transformer> = Arc::new(transformer);
        Self {
            input: shared.clone(),
            output: shared,
        }
    }

    pub fn split(input: impl Transformer + 'static, output: impl Transformer + 'static) -> Self {
        Self {
            input: Arc::new(input),
            output: Arc::new(output),
        }
    }
}

impl Default for Transformers {
    fn default() -> Self {
        Self::uniform(IdentityTransformer)
    }
}

impl std::fmt::Debug for Transformers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Transformers")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::LinkwireError;
    use serde_json::json;

    /// Wraps every value as `{"json": value}`.
    pub(crate) struct Wrapping;

    impl Transformer for Wrapping {
        fn serialize(&self, value: Value) -> Result<Value> {
            Ok(json!({ "json": value }))
        }

        fn deserialize(&self, value: Value) -> Result<Value> {
            match value {
                Value::Object(mut map) if map.contains_key("json") => {
                    Ok(map.remove("json").unwrap_or(Value::Null))
                }
                other => Err(LinkwireError::Transform(format!("not wrapped: {other}"))),
            }
        }
    }
}
