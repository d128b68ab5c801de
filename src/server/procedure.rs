//! Procedure builder and the per-call chain runner.
//!
//! ```
//! use linkwire::server::ProcedureBuilder;
//! use linkwire::validator::SerdeValidator;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! let base = ProcedureBuilder::new().meta("auth", true);
//! let greet = base
//!     .clone()
//!     .input(SerdeValidator::<Greet>::new())
//!     .query(|input: Greet, _frame| async move { Ok(format!("hello {}", input.name)) });
//! # let _ = greet;
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::middleware::{Middleware, MiddlewareFrame, MiddlewareResult, Next, ProcedureOutput};
use crate::context::ContextMergePolicy;
use crate::envelope::ProcedureKind;
use crate::observable::Observable;
use crate::rpc_error::NormalizedError;
use crate::validator::Validator;

/// Terminal step of a procedure.
trait Resolver: Send + Sync + 'static {
    fn resolve(&self, input: Value, frame: MiddlewareFrame) -> BoxFuture<'static, MiddlewareResult>;
}

struct FnResolver<F>(F);

impl<F, Fut> Resolver for FnResolver<F>
where
    F: Fn(Value, MiddlewareFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    fn resolve(&self, input: Value, frame: MiddlewareFrame) -> BoxFuture<'static, MiddlewareResult> {
        (self.0)(input, frame).boxed()
    }
}

#[derive(Clone)]
enum Step {
    Middleware(Arc<dyn Middleware>),
    Input(Arc<dyn Validator>),
    Output(Arc<dyn Validator>),
}

pub(crate) struct ProcedureInner {
    kind: ProcedureKind,
    pub(crate) meta: Arc<Map<String, Value>>,
    steps: Vec<Step>,
    resolver: Box<dyn Resolver>,
}

impl ProcedureInner {
    /// Execute `steps[position..]` and then the resolver.
    pub(crate) fn run_from(
        self: Arc<Self>,
        position: usize,
        mut frame: MiddlewareFrame,
        merge: ContextMergePolicy,
    ) -> BoxFuture<'static, MiddlewareResult> {
        let Some(step) = self.steps.get(position).cloned() else {
            return self.finish(frame);
        };

        let next = move |procedure: Arc<Self>, frame: MiddlewareFrame| Next {
            procedure,
            position: position + 1,
            frame,
            merge,
        };

        match step {
            Step::Middleware(middleware) => {
                let continuation = next(self.clone(), frame.clone());
                middleware.handle(frame, continuation)
            }

            Step::Input(validator) => async move {
                let cell = frame.validated_at(position);
                let validated = cell
                    .get_or_init(|| async {
                        let raw = frame.raw_input().await?;
                        validator.validate(raw).await.map_err(|e| {
                            NormalizedError::bad_input(e.message.clone()).with_cause(e)
                        })
                    })
                    .await
                    .clone()?;
                frame.input = Some(validated);
                next(self, frame).run().await
            }
            .boxed(),

            Step::Output(validator) => async move {
                match next(self, frame).run().await? {
                    ProcedureOutput::Value(value) => validator
                        .validate(value)
                        .await
                        .map(ProcedureOutput::Value)
                        .map_err(|e| {
                            NormalizedError::internal("Output validation failed").with_cause(e)
                        }),
                    stream => Ok(stream),
                }
            }
            .boxed(),
        }
    }

    fn finish(self: Arc<Self>, frame: MiddlewareFrame) -> BoxFuture<'static, MiddlewareResult> {
        async move {
            let input = match frame.input.clone() {
                Some(validated) => validated,
                None => frame.raw_input().await?,
            };
            let declared = self.kind;
            let output = self.resolver.resolve(input, frame).await?;

            match (declared, &output) {
                (ProcedureKind::Subscription, ProcedureOutput::Value(_)) => Err(
                    NormalizedError::internal("Subscription procedure did not return a stream"),
                ),
                (ProcedureKind::Query | ProcedureKind::Mutation, ProcedureOutput::Stream(_)) => {
                    Err(NormalizedError::internal(format!(
                        "{declared} procedure returned a stream"
                    )))
                }
                _ => Ok(output),
            }
        }
        .boxed()
    }
}

/// A registered procedure: metadata, ordered steps and the handler.
#[derive(Clone)]
pub struct Procedure {
    pub(crate) inner: Arc<ProcedureInner>,
}

impl Procedure {
    pub fn kind(&self) -> ProcedureKind {
        self.inner.kind
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.inner.meta
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("kind", &self.inner.kind)
            .field("steps", &self.inner.steps.len())
            .finish()
    }
}

/// Builder for procedures. Clone it to share middleware between procedures.
#[derive(Clone, Default)]
pub struct ProcedureBuilder {
    meta: Map<String, Value>,
    steps: Vec<Step>,
}

impl ProcedureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a metadata entry, visible to middleware as `frame.meta`.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Append a middleware. Steps run in the order they were added.
    pub fn use_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.steps.push(Step::Middleware(middleware));
        self
    }

    /// Validate the raw input at this point of the chain.
    pub fn input(mut self, validator: impl Validator) -> Self {
        self.steps.push(Step::Input(Arc::new(validator)));
        self
    }

    /// Validate query/mutation results at this point of the chain.
    pub fn output(mut self, validator: impl Validator) -> Self {
        self.steps.push(Step::Output(Arc::new(validator)));
        self
    }

    pub fn query<T, O, F, Fut>(self, handler: F) -> Procedure
    where
        T: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(T, MiddlewareFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NormalizedError>> + Send + 'static,
    {
        self.typed_value(ProcedureKind::Query, handler)
    }

    pub fn mutation<T, O, F, Fut>(self, handler: F) -> Procedure
    where
        T: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(T, MiddlewareFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NormalizedError>> + Send + 'static,
    {
        self.typed_value(ProcedureKind::Mutation, handler)
    }

    /// Subscription whose handler returns an [`Observable`].
    pub fn subscription<T, O, F, Fut>(self, handler: F) -> Procedure
    where
        T: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(T, MiddlewareFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Observable<O, NormalizedError>, NormalizedError>>
            + Send
            + 'static,
    {
        let handler = Arc::new(handler);
        self.resolver(ProcedureKind::Subscription, move |input, frame| {
            let handler = handler.clone();
            async move {
                let input = decode_input::<T>(input)?;
                let observable = handler(input, frame).await?;
                Ok(ProcedureOutput::Stream(observable.try_map(encode_output)))
            }
        })
    }

    /// Generator-style subscription: the handler returns a `Stream` that is
    /// pulled on a task and dropped when the subscription is torn down.
    pub fn subscription_stream<T, O, F, S>(self, handler: F) -> Procedure
    where
        T: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(T, MiddlewareFrame) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<O, NormalizedError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.resolver(ProcedureKind::Subscription, move |input, frame| {
            let handler = handler.clone();
            async move {
                let input = decode_input::<T>(input)?;
                let stream = Arc::new(Mutex::new(Some(handler(input, frame).boxed())));
                let observable = Observable::from_stream(move || {
                    stream
                        .lock()
                        .take()
                        .unwrap_or_else(|| futures::stream::empty().boxed())
                });
                Ok(ProcedureOutput::Stream(observable.try_map(encode_output)))
            }
        })
    }

    /// Untyped handler working on raw values. The returned variant is
    /// checked against `kind` at runtime.
    pub fn resolver<F, Fut>(self, kind: ProcedureKind, handler: F) -> Procedure
    where
        F: Fn(Value, MiddlewareFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MiddlewareResult> + Send + 'static,
    {
        Procedure {
            inner: Arc::new(ProcedureInner {
                kind,
                meta: Arc::new(self.meta),
                steps: self.steps,
                resolver: Box::new(FnResolver(handler)),
            }),
        }
    }

    fn typed_value<T, O, F, Fut>(self, kind: ProcedureKind, handler: F) -> Procedure
    where
        T: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(T, MiddlewareFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NormalizedError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.resolver(kind, move |input, frame| {
            let decoded = decode_input::<T>(input);
            let handler = handler.clone();
            async move {
                let output = handler(decoded?, frame).await?;
                Ok(ProcedureOutput::Value(encode_output(output)?))
            }
        })
    }
}

fn decode_input<T: DeserializeOwned>(input: Value) -> Result<T, NormalizedError> {
    serde_json::from_value(input)
        .map_err(|e| NormalizedError::bad_input(format!("Invalid input: {e}")).with_cause(e))
}

fn encode_output<O: Serialize>(output: O) -> Result<Value, NormalizedError> {
    serde_json::to_value(output)
        .map_err(|e| NormalizedError::internal("Failed to serialize output").with_cause(e))
}
