//! Onion-style middleware chain.
//!
//! A procedure is `m1, m2, ..., mk, handler`. Each middleware receives the
//! current [`MiddlewareFrame`] and a [`Next`]; awaiting `next.run()` (or
//! `next.run_with(patch)`) executes the rest of the chain and returns its
//! outcome, which the middleware may inspect or replace. Returning without
//! calling `next` short-circuits everything downstream.
//!
//! ```
//! use linkwire::context::ContextPatch;
//! use linkwire::rpc_error::NormalizedError;
//! use linkwire::server::{middleware_fn, MiddlewareFrame, Next};
//!
//! let auth = middleware_fn(|frame: MiddlewareFrame, next: Next| async move {
//!     match frame.ctx.get::<String>("token") {
//!         Some(token) => {
//!             let user = token.to_uppercase();
//!             next.run_with(ContextPatch::new().set("user", user)).await
//!         }
//!         None => Err(NormalizedError::unauthorized("missing token")),
//!     }
//! });
//! # let _ = auth;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::procedure::ProcedureInner;
use crate::context::{Context, ContextMergePolicy, ContextPatch};
use crate::envelope::ProcedureKind;
use crate::observable::Observable;
use crate::rpc_error::NormalizedError;

/// What a procedure resolves to.
pub enum ProcedureOutput {
    /// Query/mutation result.
    Value(Value),
    /// Subscription stream.
    Stream(Observable<Value, NormalizedError>),
}

impl ProcedureOutput {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ProcedureOutput::Value(v) => Some(v),
            ProcedureOutput::Stream(_) => None,
        }
    }
}

impl std::fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcedureOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ProcedureOutput::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Outcome of a middleware or handler.
pub type MiddlewareResult = Result<ProcedureOutput, NormalizedError>;

type InputSource = BoxFuture<'static, Result<Value, NormalizedError>>;

struct LazyInner {
    cell: OnceCell<Result<Value, NormalizedError>>,
    source: Mutex<Option<InputSource>>,
}

/// Raw input resolved on first access and cached for the operation.
#[derive(Clone)]
pub struct LazyInput {
    inner: Arc<LazyInner>,
}

impl LazyInput {
    /// Input already in memory.
    pub fn ready(value: Value) -> Self {
        Self {
            inner: Arc::new(LazyInner {
                cell: OnceCell::new_with(Some(Ok(value))),
                source: Mutex::new(None),
            }),
        }
    }

    /// Input produced by `source` the first time it is needed.
    pub fn deferred<F>(source: F) -> Self
    where
        F: Future<Output = Result<Value, NormalizedError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(LazyInner {
                cell: OnceCell::new(),
                source: Mutex::new(Some(source.boxed())),
            }),
        }
    }

    /// Resolve (once) and return the input.
    pub async fn get(&self) -> Result<Value, NormalizedError> {
        self.inner
            .cell
            .get_or_init(|| async {
                let source = self.inner.source.lock().take();
                match source {
                    Some(source) => source.await,
                    None => Ok(Value::Null),
                }
            })
            .await
            .clone()
    }
}

type Validated = Arc<OnceCell<Result<Value, NormalizedError>>>;

/// Per-operation state seen by middleware and handlers.
#[derive(Clone)]
pub struct MiddlewareFrame {
    /// Accumulated context.
    pub ctx: Context,
    pub path: Arc<str>,
    pub kind: ProcedureKind,
    /// Procedure metadata set with `ProcedureBuilder::meta`.
    pub meta: Arc<Map<String, Value>>,
    /// Cancelled when the caller aborts or the connection drops.
    pub signal: CancellationToken,
    pub(crate) raw_input: LazyInput,
    pub(crate) input: Option<Value>,
    /// Input validation outcomes keyed by step, shared by every frame of
    /// the operation.
    validated: Arc<Mutex<HashMap<usize, Validated>>>,
}

impl MiddlewareFrame {
    pub(crate) fn new(
        ctx: Context,
        path: Arc<str>,
        kind: ProcedureKind,
        meta: Arc<Map<String, Value>>,
        signal: CancellationToken,
        raw_input: LazyInput,
    ) -> Self {
        Self {
            ctx,
            path,
            kind,
            meta,
            signal,
            raw_input,
            input: None,
            validated: Arc::default(),
        }
    }

    /// Validation cell of the step at `position`.
    pub(crate) fn validated_at(&self, position: usize) -> Validated {
        self.validated.lock().entry(position).or_default().clone()
    }

    /// The input as sent by the caller, after transformer decoding.
    pub async fn raw_input(&self) -> Result<Value, NormalizedError> {
        self.raw_input.get().await
    }

    /// The validated input, once an input validator has run.
    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }
}

/// A middleware step.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, frame: MiddlewareFrame, next: Next) -> BoxFuture<'static, MiddlewareResult>;
}

struct FnMiddleware<F>(F);

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(MiddlewareFrame, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    fn handle(&self, frame: MiddlewareFrame, next: Next) -> BoxFuture<'static, MiddlewareResult> {
        (self.0)(frame, next).boxed()
    }
}

/// Build a middleware from an async closure.
pub fn middleware_fn<F, Fut>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(MiddlewareFrame, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    Arc::new(FnMiddleware(f))
}

/// Continuation handed to a middleware.
///
/// Cloning it lets a middleware run the rest of the chain more than once;
/// input validators downstream still run once per operation.
#[derive(Clone)]
pub struct Next {
    pub(crate) procedure: Arc<ProcedureInner>,
    pub(crate) position: usize,
    pub(crate) frame: MiddlewareFrame,
    pub(crate) merge: ContextMergePolicy,
}

impl Next {
    /// Run the rest of the chain with the context unchanged.
    pub fn run(self) -> BoxFuture<'static, MiddlewareResult> {
        self.procedure.clone().run_from(self.position, self.frame, self.merge)
    }

    /// Run the rest of the chain with `patch` merged into the context.
    pub fn run_with(self, patch: ContextPatch) -> BoxFuture<'static, MiddlewareResult> {
        let mut frame = self.frame;
        match frame.ctx.merge(patch, self.merge) {
            Ok(ctx) => frame.ctx = ctx,
            Err(e) => return futures::future::ready(Err(e)).boxed(),
        }
        self.procedure.clone().run_from(self.position, frame, self.merge)
    }
}
