use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::link::{Link, LinkChain, OperationStream};
use crate::envelope::{Operation, ProcedureKind};
use crate::observable::{relay, Observable, Teardown};
use crate::rpc_error::{ClientError, ErrorKind};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cancelling it aborts the call; the caller sees `ABORTED`.
    pub signal: Option<CancellationToken>,
    /// Initial operation context for the links.
    pub context: Map<String, Value>,
}

impl CallOptions {
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

#[derive(Default)]
pub struct RpcClientBuilder {
    links: Vec<Arc<dyn Link>>,
}

impl RpcClientBuilder {
    pub fn link(mut self, link: impl Link) -> Self {
        self.links.push(Arc::new(link));
        self
    }

    pub fn link_arc(mut self, link: Arc<dyn Link>) -> Self {
        self.links.push(link);
        self
    }

    pub fn build(self) -> RpcClient {
        RpcClient {
            chain: LinkChain::new(self.links),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Typed entry point running operations through a link chain.
#[derive(Clone, Debug)]
pub struct RpcClient {
    chain: LinkChain,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn builder() -> RpcClientBuilder {
        RpcClientBuilder::default()
    }

    pub fn chain(&self) -> &LinkChain {
        &self.chain
    }

    /// Run an untyped operation.
    ///
    /// Cancelling `options.signal` ends the returned stream with `ABORTED`
    /// and unsubscribes from the chain. Exactly one terminal event is
    /// delivered, whichever of cancellation and completion happens first.
    pub fn request(
        &self,
        kind: ProcedureKind,
        path: &str,
        input: Value,
        options: CallOptions,
    ) -> OperationStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let caller_signal = options.signal;
        let op = Operation::new(id, kind, path, input)
            .with_signal(caller_signal.clone().unwrap_or_default())
            .with_context(options.context);
        let chain = self.chain.clone();

        Observable::new(move |subscriber| {
            if op.signal.is_cancelled() {
                subscriber.error(ClientError::aborted());
                return Teardown::noop();
            }

            let upstream = chain
                .execute(op.clone())
                .subscribe(relay(subscriber.clone(), Ok, |e| e));
            let Some(signal) = caller_signal.clone() else {
                return upstream.into();
            };

            let stop = CancellationToken::new();
            let watching = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watching.cancelled() => {}
                    _ = signal.cancelled() => subscriber.error(ClientError::aborted()),
                }
            });
            Teardown::new(move || {
                stop.cancel();
                upstream.unsubscribe();
            })
        })
    }

    pub async fn query<I, O>(&self, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.query_with(path, input, CallOptions::default()).await
    }

    pub async fn query_with<I, O>(
        &self,
        path: &str,
        input: &I,
        options: CallOptions,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.single(ProcedureKind::Query, path, input, options).await
    }

    pub async fn mutation<I, O>(&self, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.mutation_with(path, input, CallOptions::default()).await
    }

    pub async fn mutation_with<I, O>(
        &self,
        path: &str,
        input: &I,
        options: CallOptions,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.single(ProcedureKind::Mutation, path, input, options).await
    }

    /// Subscribe to a subscription procedure. Nothing is sent until the
    /// returned observable is subscribed.
    pub fn subscribe<I, O>(&self, path: &str, input: &I) -> Observable<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Send + 'static,
    {
        self.subscribe_with(path, input, CallOptions::default())
    }

    pub fn subscribe_with<I, O>(
        &self,
        path: &str,
        input: &I,
        options: CallOptions,
    ) -> Observable<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Send + 'static,
    {
        match encode(path, input) {
            Ok(input) => self
                .request(ProcedureKind::Subscription, path, input, options)
                .try_map(|response| decode(response.data)),
            Err(error) => Observable::failed(error),
        }
    }

    async fn single<I, O>(
        &self,
        kind: ProcedureKind,
        path: &str,
        input: &I,
        options: CallOptions,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = encode(path, input)?;
        match self.request(kind, path, input, options).first_value().await {
            Some(result) => decode(result?.data),
            None => Err(ClientError::transport(format!(
                "{kind} {path} completed without a result"
            ))),
        }
    }
}

fn encode<I: Serialize + ?Sized>(path: &str, input: &I) -> Result<Value, ClientError> {
    serde_json::to_value(input).map_err(|e| {
        ClientError::client(
            ErrorKind::BadInput,
            format!("Unable to serialize input for {path}: {e}"),
        )
    })
}

fn decode<O: DeserializeOwned>(data: Value) -> Result<O, ClientError> {
    serde_json::from_value(data)
        .map_err(|e| ClientError::client(ErrorKind::ParseError, format!("Unexpected result: {e}")))
}
