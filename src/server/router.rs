//! Immutable path → procedure table.
//!
//! Routers are assembled once with [`RouterBuilder`] (or [`merge_routers`])
//! and never change afterwards, so a built [`Router`] can be shared between
//! concurrent calls without locking.
//!
//! # Example
//!
//! ```
//! use linkwire::server::{ProcedureBuilder, Router};
//!
//! let users = Router::builder()
//!     .register("get", ProcedureBuilder::new().query(|id: u64, _| async move { Ok(id) }))?
//!     .build();
//!
//! let app = Router::builder().nest("user", users)?.build();
//! assert!(app.get("user.get").is_some());
//! # Ok::<(), linkwire::LinkwireError>(())
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use super::procedure::Procedure;
use crate::error::{LinkwireError, Result};

/// Built routing table.
#[derive(Clone, Default)]
pub struct Router {
    procedures: Arc<HashMap<String, Procedure>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Exact-path lookup.
    pub fn get(&self, path: &str) -> Option<&Procedure> {
        self.procedures.get(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("paths", &self.paths()).finish()
    }
}

/// Collects procedures, rejecting collisions as they are added.
#[derive(Default)]
pub struct RouterBuilder {
    procedures: HashMap<String, Procedure>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `procedure` under `path`.
    pub fn register(mut self, path: &str, procedure: Procedure) -> Result<Self> {
        validate_path(path)?;
        self.insert(path.to_string(), procedure)?;
        Ok(self)
    }

    /// Mount every procedure of `router` under `prefix.`.
    pub fn nest(mut self, prefix: &str, router: Router) -> Result<Self> {
        validate_path(prefix)?;
        for (path, procedure) in router.procedures.iter() {
            self.insert(format!("{prefix}.{path}"), procedure.clone())?;
        }
        Ok(self)
    }

    /// Add every procedure of `router` at its own path.
    pub fn merge(mut self, router: Router) -> Result<Self> {
        for (path, procedure) in router.procedures.iter() {
            self.insert(path.clone(), procedure.clone())?;
        }
        Ok(self)
    }

    pub fn build(self) -> Router {
        Router {
            procedures: Arc::new(self.procedures),
        }
    }

    fn insert(&mut self, path: String, procedure: Procedure) -> Result<()> {
        if self.procedures.contains_key(&path) {
            return Err(LinkwireError::DuplicatePath(path));
        }
        self.procedures.insert(path, procedure);
        Ok(())
    }
}

/// Flatten several routers into one. Fails on the first duplicate path.
pub fn merge_routers(routers: impl IntoIterator<Item = Router>) -> Result<Router> {
    routers
        .into_iter()
        .try_fold(RouterBuilder::new(), RouterBuilder::merge)
        .map(RouterBuilder::build)
}

fn validate_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path
            .split('.')
            .all(|segment| !segment.is_empty() && !segment.chars().any(char::is_whitespace));
    if valid {
        Ok(())
    } else {
        Err(LinkwireError::InvalidPath(path.to_string()))
    }
}
