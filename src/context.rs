//! Server-side request context.
//!
//! A [`Context`] is an immutable string-keyed map of typed values. Middleware
//! never mutates it; calling `next` with a [`ContextPatch`] produces a new
//! context for everything downstream. Patches are applied left-to-right, so
//! later middleware sees the union of all earlier patches.
//!
//! # Example
//!
//! ```
//! use linkwire::context::{Context, ContextMergePolicy, ContextPatch};
//!
//! let base = Context::new().with("tenant", "acme".to_string());
//! let next = base
//!     .merge(ContextPatch::new().set("user_id", 7u64), ContextMergePolicy::LastWriteWins)
//!     .unwrap();
//!
//! assert_eq!(next.get::<String>("tenant").map(String::as_str), Some("acme"));
//! assert_eq!(next.get::<u64>("user_id"), Some(&7));
//! assert!(base.get::<u64>("user_id").is_none());
//! ```

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::rpc_error::NormalizedError;

type Entry = Arc<dyn Any + Send + Sync>;

/// How a patch may treat keys that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMergePolicy {
    /// The patch value replaces the existing one.
    #[default]
    LastWriteWins,
    /// Replacing a key with a value of a different type fails with `Internal`.
    /// Same-type replacement is allowed.
    RejectIncompatible,
}

/// Immutable, cheaply cloneable context.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<BTreeMap<String, Entry>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this context with `key` set, for building initial contexts.
    pub fn with<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key.into(), Arc::new(value));
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Typed lookup; `None` if missing or stored with another type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `patch` on top of this context.
    pub fn merge(
        &self,
        patch: ContextPatch,
        policy: ContextMergePolicy,
    ) -> Result<Context, NormalizedError> {
        if patch.entries.is_empty() {
            return Ok(self.clone());
        }

        let mut entries = (*self.entries).clone();
        for (key, value) in patch.entries {
            if policy == ContextMergePolicy::RejectIncompatible {
                if let Some(existing) = entries.get(&key) {
                    if type_of(existing) != type_of(&value) {
                        return Err(NormalizedError::internal(format!(
                            "Context key {key:?} redefined with an incompatible type"
                        )));
                    }
                }
            }
            entries.insert(key, value);
        }

        Ok(Context {
            entries: Arc::new(entries),
        })
    }
}

fn type_of(entry: &Entry) -> TypeId {
    (**entry).type_id()
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Ordered list of key/value writes passed to `next`.
#[derive(Default)]
pub struct ContextPatch {
    entries: Vec<(String, Entry)>,
}

impl ContextPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write; later writes to the same key win within one patch.
    pub fn set<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.entries.push((key.into(), Arc::new(value)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ContextPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(k, _)| k))
            .finish()
    }
}
