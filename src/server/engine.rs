//! Procedure resolution engine.
//!
//! [`Server`] owns the router and configuration and turns one decoded call
//! into a [`ProcedureOutput`] or a [`NormalizedError`]:
//!
//! 1. look up the path (`NotFound`) and check the declared kind
//!    (`MethodNotSupported`)
//! 2. run the procedure's middleware/validator chain and handler, catching
//!    panics (`Internal`), honouring the call's cancellation token
//!    (`Aborted`) and the configured timeout (`Timeout`)
//! 3. log the error with its cause and hand it to the `on_error` hook
//!
//! Transport bindings sit on top: [`Server::respond`] for one request,
//! [`Server::subscribe`] for subscriptions, `handle_request` for raw
//! request bodies and `serve_connection` for persistent connections.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::middleware::{LazyInput, MiddlewareFrame, MiddlewareResult, ProcedureOutput};
use super::router::Router;
use crate::codec::Transformers;
use crate::context::{Context, ContextMergePolicy};
use crate::envelope::{ProcedureKind, ResponseEnvelope, WireRequest};
use crate::observable::{panic_message, Observable, Observer, Subscription, Teardown};
use crate::rpc_error::{
    format_error, DefaultErrorFormatter, ErrorFormatter, ErrorKind, NormalizedError,
    SharedFormatter,
};

/// Default maximum number of operations in one batch request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Called with every error a procedure call produced, before formatting.
pub type ErrorHook = Arc<dyn Fn(&NormalizedError, Option<&str>) + Send + Sync>;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Value transformers for inputs (client → server) and results.
    pub transformers: Transformers,
    pub error_formatter: SharedFormatter,
    /// Include `data.stack` in error shapes.
    pub is_dev: bool,
    pub context_merge: ContextMergePolicy,
    /// Upper bound for a query/mutation call. Subscriptions are unbounded.
    pub procedure_timeout: Option<Duration>,
    pub max_batch_size: usize,
    pub on_error: Option<ErrorHook>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transformers: Transformers::default(),
            error_formatter: Arc::new(DefaultErrorFormatter),
            is_dev: false,
            context_merge: ContextMergePolicy::default(),
            procedure_timeout: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("is_dev", &self.is_dev)
            .field("context_merge", &self.context_merge)
            .field("procedure_timeout", &self.procedure_timeout)
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    router: Router,
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            config: ServerConfig::default(),
        }
    }

    pub fn transformer(mut self, transformers: Transformers) -> Self {
        self.config.transformers = transformers;
        self
    }

    pub fn error_formatter(mut self, formatter: impl ErrorFormatter + 'static) -> Self {
        self.config.error_formatter = Arc::new(formatter);
        self
    }

    /// Include stack traces in error shapes.
    ///
    /// Default: false
    pub fn is_dev(mut self, is_dev: bool) -> Self {
        self.config.is_dev = is_dev;
        self
    }

    pub fn context_merge(mut self, policy: ContextMergePolicy) -> Self {
        self.config.context_merge = policy;
        self
    }

    /// Fail queries and mutations that run longer than `timeout`.
    pub fn procedure_timeout(mut self, timeout: Duration) -> Self {
        self.config.procedure_timeout = Some(timeout);
        self
    }

    /// Default: 100
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.config.max_batch_size = max;
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&NormalizedError, Option<&str>) + Send + Sync + 'static,
    {
        self.config.on_error = Some(Arc::new(hook));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                router: self.router,
                config: self.config,
            }),
        }
    }
}

pub(super) struct ServerInner {
    pub(super) router: Router,
    pub(super) config: ServerConfig,
}

/// Cheaply cloneable handle to a router plus its configuration.
#[derive(Clone)]
pub struct Server {
    pub(super) inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder(router: Router) -> ServerBuilder {
        ServerBuilder::new(router)
    }

    /// Server with default configuration.
    pub fn new(router: Router) -> Self {
        ServerBuilder::new(router).build()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Resolve one call.
    ///
    /// `input` is in wire form; it is passed through the input transformer
    /// the first time a validator, middleware or the handler asks for it.
    pub async fn resolve(
        &self,
        path: &str,
        kind: ProcedureKind,
        input: Value,
        ctx: Context,
        signal: CancellationToken,
    ) -> MiddlewareResult {
        let result = self.run_call(path, kind, input, ctx, signal).await;
        if let Err(error) = &result {
            self.report(error, Some(path));
        }
        result
    }

    async fn run_call(
        &self,
        path: &str,
        kind: ProcedureKind,
        input: Value,
        ctx: Context,
        signal: CancellationToken,
    ) -> MiddlewareResult {
        let procedure = self.inner.router.get(path).ok_or_else(|| {
            NormalizedError::not_found(format!("No procedure found on path \"{path}\""))
        })?;
        if procedure.kind() != kind {
            return Err(NormalizedError::new(
                ErrorKind::MethodNotSupported,
                format!(
                    "Unsupported {kind} call to {} procedure at path \"{path}\"",
                    procedure.kind()
                ),
            ));
        }

        let transformer = self.inner.config.transformers.input.clone();
        let raw_input = LazyInput::deferred(async move {
            transformer
                .deserialize(input)
                .map_err(|e| NormalizedError::bad_input(e.to_string()).with_cause(e))
        });
        let frame = MiddlewareFrame::new(
            ctx,
            Arc::from(path),
            kind,
            procedure.inner.meta.clone(),
            signal.clone(),
            raw_input,
        );

        let inner = procedure.inner.clone();
        let merge = self.inner.config.context_merge;
        // Middleware bodies may run synchronously; start the chain inside
        // the guarded future.
        let chain = async move { inner.run_from(0, frame, merge).await };
        let guarded = AssertUnwindSafe(chain).catch_unwind().map(|outcome| {
            outcome.unwrap_or_else(|panic| {
                Err(NormalizedError::internal(panic_message(panic.as_ref())))
            })
        });

        let timeout = match kind {
            ProcedureKind::Subscription => None,
            _ => self.inner.config.procedure_timeout,
        };

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(NormalizedError::aborted()),
            result = with_timeout(guarded, timeout) => result,
        }
    }

    /// Resolve a query or mutation into its response envelope.
    pub async fn respond(
        &self,
        request: WireRequest,
        ctx: Context,
        signal: CancellationToken,
    ) -> ResponseEnvelope {
        self.answer(request, ctx, signal).await.1
    }

    /// Like [`Server::respond`], also returning the http-like status.
    pub(super) async fn answer(
        &self,
        request: WireRequest,
        ctx: Context,
        signal: CancellationToken,
    ) -> (u16, ResponseEnvelope) {
        let WireRequest {
            id,
            path,
            kind,
            input,
        } = request;

        let outcome = if kind == ProcedureKind::Subscription {
            let error = NormalizedError::new(
                ErrorKind::MethodNotSupported,
                "Subscriptions require a subscription-capable transport",
            );
            self.report(&error, Some(&path));
            Err(error)
        } else {
            match self.resolve(&path, kind, input, ctx, signal).await {
                Ok(ProcedureOutput::Value(data)) => self.encode_data(data).map_err(|error| {
                    self.report(&error, Some(&path));
                    error
                }),
                Ok(ProcedureOutput::Stream(_)) => {
                    let error = NormalizedError::internal("Unexpected stream result");
                    self.report(&error, Some(&path));
                    Err(error)
                }
                Err(error) => Err(error),
            }
        };

        let (status, envelope) = match outcome {
            Ok(data) => (200, ResponseEnvelope::data(data)),
            Err(error) => (
                error.http_status(),
                self.error_envelope(&error, Some(&path), Some(kind)),
            ),
        };
        (status, envelope.with_id(id))
    }

    /// Run a subscription call as a stream of envelopes.
    ///
    /// Emits `started`, one data envelope per value and `stopped` when the
    /// procedure's stream completes. A failure is delivered as an error
    /// envelope followed by completion. Unsubscribing aborts a call still
    /// resolving, or tears down the procedure's stream.
    pub fn subscribe(
        &self,
        request: WireRequest,
        ctx: Context,
    ) -> Observable<ResponseEnvelope, Infallible> {
        let server = self.clone();
        Observable::new(move |subscriber| {
            let signal = CancellationToken::new();
            let active: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

            let server = server.clone();
            let request = request.clone();
            let ctx = ctx.clone();
            let call_signal = signal.clone();
            let slot = active.clone();

            tokio::spawn(async move {
                let WireRequest {
                    id,
                    path,
                    kind,
                    input,
                } = request;

                let stream = match server.resolve(&path, kind, input, ctx, call_signal.clone()).await {
                    Ok(ProcedureOutput::Stream(stream)) => stream,
                    Ok(ProcedureOutput::Value(_)) => {
                        let error = NormalizedError::internal("Unexpected value result");
                        server.report(&error, Some(&path));
                        subscriber.next(server.error_envelope(&error, Some(&path), Some(kind)).with_id(id));
                        subscriber.complete();
                        return;
                    }
                    Err(error) => {
                        subscriber.next(server.error_envelope(&error, Some(&path), Some(kind)).with_id(id));
                        subscriber.complete();
                        return;
                    }
                };

                subscriber.next(ResponseEnvelope::started().with_id(id));

                let path: Arc<str> = Arc::from(path);
                let (on_value, on_error, on_done) =
                    (subscriber.clone(), subscriber.clone(), subscriber);
                let (value_server, error_server) = (server.clone(), server);
                let (value_path, error_path) = (path.clone(), path);

                let subscription = stream.subscribe(
                    Observer::new()
                        .on_next(move |value| match value_server.encode_data(value) {
                            Ok(data) => on_value.next(ResponseEnvelope::data(data).with_id(id)),
                            Err(error) => {
                                value_server.report(&error, Some(&value_path));
                                on_value.next(
                                    value_server
                                        .error_envelope(&error, Some(&value_path), Some(kind))
                                        .with_id(id),
                                );
                                on_value.complete();
                            }
                        })
                        .on_error(move |error: NormalizedError| {
                            error_server.report(&error, Some(&error_path));
                            on_error.next(
                                error_server
                                    .error_envelope(&error, Some(&error_path), Some(kind))
                                    .with_id(id),
                            );
                            on_error.complete();
                        })
                        .on_complete(move || {
                            on_done.next(ResponseEnvelope::stopped().with_id(id));
                            on_done.complete();
                        }),
                );

                let mut slot = slot.lock();
                if call_signal.is_cancelled() {
                    drop(slot);
                    subscription.unsubscribe();
                } else {
                    *slot = Some(subscription);
                }
            });

            Teardown::new(move || {
                signal.cancel();
                let subscription = active.lock().take();
                if let Some(subscription) = subscription {
                    subscription.unsubscribe();
                }
            })
        })
    }

    /// Format `error` for the wire and pass the shape through the output
    /// transformer.
    pub fn format_error(
        &self,
        error: &NormalizedError,
        path: Option<&str>,
        kind: Option<ProcedureKind>,
    ) -> Value {
        let config = &self.inner.config;
        let shape = format_error(&*config.error_formatter, error, path, kind, config.is_dev);
        match config.transformers.output.serialize(shape.clone()) {
            Ok(shape) => shape,
            Err(e) => {
                warn!(error = %e, "output transformer rejected an error shape");
                shape
            }
        }
    }

    pub(super) fn error_envelope(
        &self,
        error: &NormalizedError,
        path: Option<&str>,
        kind: Option<ProcedureKind>,
    ) -> ResponseEnvelope {
        ResponseEnvelope::error(self.format_error(error, path, kind))
    }

    pub(super) fn encode_data(&self, data: Value) -> Result<Value, NormalizedError> {
        self.inner
            .config
            .transformers
            .output
            .serialize(data)
            .map_err(|e| NormalizedError::internal("Failed to transform output").with_cause(e))
    }

    pub(super) fn report(&self, error: &NormalizedError, path: Option<&str>) {
        let at = path.unwrap_or("-");
        match error.kind() {
            ErrorKind::Internal => error!(path = at, kind = %error.kind(), "{}", error.stack()),
            kind => debug!(path = at, kind = %kind, "{}", error.stack()),
        }
        if let Some(hook) = &self.inner.config.on_error {
            hook(error, path);
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("router", &self.inner.router)
            .field("config", &self.inner.config)
            .finish()
    }
}

async fn with_timeout<F>(call: F, timeout: Option<Duration>) -> MiddlewareResult
where
    F: std::future::Future<Output = MiddlewareResult>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(NormalizedError::new(
                ErrorKind::Timeout,
                format!("Procedure timed out after {}ms", limit.as_millis()),
            ))
        }),
        None => call.await,
    }
}
