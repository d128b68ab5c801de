//! Batching terminal link.
//!
//! Queries and mutations issued within one window are collected per kind
//! and sent as one request whose body is the array of operations:
//!
//! ```text
//! op 0 ─┐                       ┌─► {"0":..}  ─► op 0
//! op 1 ─┼─► [op0, op1, op2] ─►  ├─► {"2":..}  ─► op 2
//! op 2 ─┘                       └─► {"1":..}  ─► op 1
//! ```
//!
//! In [`BatchMode::Buffered`] the response is a JSON array in request
//! order. In [`BatchMode::Streamed`] it uses the indexed framing and each
//! operation resolves as soon as its own entry arrives.
//!
//! An operation cancelled before dispatch is dropped from its batch. A
//! dispatched request is aborted once no operation in it is still waiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::link::{decode_envelope, encode_input, Link, LinkNext, OperationStream};
use crate::client::transport::{Transport, TransportResponse};
use crate::codec::Transformers;
use crate::envelope::{
    Operation, OperationResponse, ProcedureKind, RawRequest, ResponseEnvelope, WireRequest,
    BATCH_MODE_KEY, BATCH_MODE_STREAM,
};
use crate::observable::{Observable, Subscriber, Teardown};
use crate::protocol::parse_batch_stream;
use crate::rpc_error::{ClientError, ErrorKind};

/// Default maximum number of operations in one request.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 100;

/// Default maximum number of operations waiting for dispatch, per kind.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// How long operations are collected before a batch is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchWindow {
    /// Until the current task yields.
    #[default]
    Tick,
    /// For a fixed duration after the first queued operation.
    After(Duration),
}

/// Framing requested for batch responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    #[default]
    Buffered,
    Streamed,
}

#[derive(Debug, Clone)]
pub struct BatchLinkConfig {
    /// Larger batches are split into several requests.
    pub max_items: usize,
    /// Operations beyond this fail with `TOO_MANY_REQUESTS` instead of
    /// growing the queue.
    pub max_pending: usize,
    pub window: BatchWindow,
    pub mode: BatchMode,
}

impl Default for BatchLinkConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_BATCH_ITEMS,
            max_pending: DEFAULT_MAX_PENDING,
            window: BatchWindow::default(),
            mode: BatchMode::default(),
        }
    }
}

/// Terminal link sending queries and mutations in batches.
///
/// Subscriptions are rejected with `METHOD_NOT_SUPPORTED`; route them to a
/// subscription-capable link with a [`SplitLink`](super::SplitLink).
#[derive(Clone)]
pub struct BatchLink {
    inner: Arc<Batcher>,
}

pub struct BatchLinkBuilder {
    transport: Arc<dyn Transport>,
    transformers: Transformers,
    config: BatchLinkConfig,
}

impl BatchLinkBuilder {
    pub fn transformers(mut self, transformers: Transformers) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn config(mut self, config: BatchLinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mode(mut self, mode: BatchMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn window(mut self, window: BatchWindow) -> Self {
        self.config.window = window;
        self
    }

    pub fn build(self) -> BatchLink {
        BatchLink {
            inner: Arc::new(Batcher {
                transport: self.transport,
                transformers: self.transformers,
                config: self.config,
                queues: Mutex::new(Queues::default()),
            }),
        }
    }
}

impl BatchLink {
    pub fn builder(transport: impl Transport) -> BatchLinkBuilder {
        BatchLinkBuilder {
            transport: Arc::new(transport),
            transformers: Transformers::default(),
            config: BatchLinkConfig::default(),
        }
    }

    pub fn new(transport: impl Transport) -> Self {
        Self::builder(transport).build()
    }

    pub fn config(&self) -> &BatchLinkConfig {
        &self.inner.config
    }
}

impl Link for BatchLink {
    fn call(&self, op: Operation, _next: LinkNext) -> OperationStream {
        if op.kind == ProcedureKind::Subscription {
            return Observable::failed(ClientError::client(
                ErrorKind::MethodNotSupported,
                format!(
                    "Subscription {} cannot be batched; route it to a subscription-capable link",
                    op.path
                ),
            ));
        }

        let batcher = self.inner.clone();
        Observable::new(move |subscriber| {
            let input = match encode_input(&op, &batcher.transformers) {
                Ok(input) => input,
                Err(error) => {
                    subscriber.error(error);
                    return Teardown::noop();
                }
            };

            let item = Arc::new(BatchItem {
                wire: op.to_wire(input),
                subscriber: subscriber.clone(),
                state: Mutex::new(ItemState::default()),
            });
            if let Err(error) = batcher.enqueue(item.clone(), op.kind) {
                subscriber.error(error);
                return Teardown::noop();
            }
            Teardown::new(move || item.release())
        })
    }
}

impl std::fmt::Debug for BatchLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLink")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

struct Batcher {
    transport: Arc<dyn Transport>,
    transformers: Transformers,
    config: BatchLinkConfig,
    queues: Mutex<Queues>,
}

#[derive(Default)]
struct Queues {
    query: Queue,
    mutation: Queue,
}

impl Queues {
    fn get_mut(&mut self, kind: ProcedureKind) -> &mut Queue {
        match kind {
            ProcedureKind::Mutation => &mut self.mutation,
            ProcedureKind::Query | ProcedureKind::Subscription => &mut self.query,
        }
    }
}

#[derive(Default)]
struct Queue {
    items: Vec<Arc<BatchItem>>,
    scheduled: bool,
}

struct BatchItem {
    wire: WireRequest,
    subscriber: Subscriber<OperationResponse, ClientError>,
    state: Mutex<ItemState>,
}

#[derive(Default)]
struct ItemState {
    released: bool,
    batch: Option<Arc<BatchState>>,
}

/// One dispatched request.
struct BatchState {
    abort: CancellationToken,
    /// Operations still waiting on this request.
    waiting: AtomicUsize,
}

impl BatchItem {
    /// Called when the caller no longer waits for this item, either because
    /// it was answered or because it unsubscribed.
    fn release(&self) {
        let batch = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.batch.clone()
        };

        if let Some(batch) = batch {
            if batch.waiting.fetch_sub(1, Ordering::AcqRel) == 1 && !batch.abort.is_cancelled() {
                debug!("no operation waiting on batch, releasing request");
                batch.abort.cancel();
            }
        }
    }

    /// Join `batch` unless already released.
    fn attach(&self, batch: &Arc<BatchState>) -> bool {
        let mut state = self.state.lock();
        if state.released {
            batch.waiting.fetch_sub(1, Ordering::AcqRel);
            false
        } else {
            state.batch = Some(batch.clone());
            true
        }
    }

    fn deliver(&self, entry: Value, transformers: &Transformers) {
        let decoded = serde_json::from_value::<ResponseEnvelope>(entry)
            .map_err(|e| ClientError::transport(format!("Malformed batch entry: {e}")))
            .and_then(|envelope| decode_envelope(envelope, false, transformers));

        match decoded {
            Ok(Some(response)) => {
                self.subscriber.next(response);
                self.subscriber.complete();
            }
            Ok(None) => self.subscriber.error(ClientError::transport(format!(
                "Batch entry for {} carried no result",
                self.wire.path
            ))),
            Err(error) => self.subscriber.error(error),
        }
    }
}

impl Batcher {
    fn enqueue(self: &Arc<Self>, item: Arc<BatchItem>, kind: ProcedureKind) -> Result<(), ClientError> {
        let schedule = {
            let mut queues = self.queues.lock();
            let queue = queues.get_mut(kind);
            if queue.items.len() >= self.config.max_pending {
                warn!(kind = %kind, pending = queue.items.len(), "batch queue full");
                return Err(ClientError::client(
                    ErrorKind::TooManyRequests,
                    format!(
                        "Batch queue is full ({} operations waiting)",
                        queue.items.len()
                    ),
                ));
            }
            queue.items.push(item);
            !std::mem::replace(&mut queue.scheduled, true)
        };

        if schedule {
            let batcher = self.clone();
            let window = self.config.window;
            tokio::spawn(async move {
                match window {
                    BatchWindow::Tick => tokio::task::yield_now().await,
                    BatchWindow::After(duration) => tokio::time::sleep(duration).await,
                }
                batcher.flush(kind);
            });
        }
        Ok(())
    }

    fn flush(self: &Arc<Self>, kind: ProcedureKind) {
        let items = {
            let mut queues = self.queues.lock();
            let queue = queues.get_mut(kind);
            queue.scheduled = false;
            std::mem::take(&mut queue.items)
        };

        for chunk in items.chunks(self.config.max_items.max(1)) {
            let batch = Arc::new(BatchState {
                abort: CancellationToken::new(),
                waiting: AtomicUsize::new(chunk.len()),
            });
            let live: Vec<Arc<BatchItem>> = chunk
                .iter()
                .filter(|item| item.attach(&batch))
                .cloned()
                .collect();
            if live.is_empty() {
                continue;
            }
            tokio::spawn(self.clone().send(live, batch));
        }
    }

    async fn send(self: Arc<Self>, items: Vec<Arc<BatchItem>>, batch: Arc<BatchState>) {
        let wires: Vec<&WireRequest> = items.iter().map(|item| &item.wire).collect();
        let body = match serde_json::to_vec(&wires) {
            Ok(body) => body,
            Err(e) => {
                return fail_all(
                    &items,
                    ClientError::transport(format!("Unable to encode batch: {e}")),
                )
            }
        };

        let streamed = self.config.mode == BatchMode::Streamed;
        let mut request = RawRequest::new(body);
        if streamed {
            request = request.with_metadata(BATCH_MODE_KEY, BATCH_MODE_STREAM);
        }

        debug!(size = items.len(), streamed, "sending batch");
        let response = match self.transport.send(request, batch.abort.clone()).await {
            Ok(response) => response,
            Err(e) => return fail_all(&items, e.into()),
        };

        // A rejected batch is answered with one error envelope, never streamed.
        if streamed && response.status == 200 {
            self.read_streamed(&items, response).await;
        } else {
            self.read_buffered(&items, response).await;
        }
    }

    async fn read_streamed(&self, items: &[Arc<BatchItem>], response: TransportResponse) {
        let result = parse_batch_stream(response.body, |index, entry| match items.get(index) {
            Some(item) => item.deliver(entry, &self.transformers),
            None => warn!(index, "batch entry for an unknown index"),
        })
        .await;

        match result {
            Ok(_) => fail_all(items, missing_result()),
            Err(e) => fail_all(
                items,
                ClientError::transport(format!("Batch stream failed: {e}")),
            ),
        }
    }

    async fn read_buffered(&self, items: &[Arc<BatchItem>], response: TransportResponse) {
        let body = match response.collect_body().await {
            Ok(body) => body,
            Err(e) => return fail_all(items, e.into()),
        };
        let body: Value = match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                return fail_all(
                    items,
                    ClientError::transport(format!("Unable to parse batch response: {e}")),
                )
            }
        };

        match body {
            Value::Array(entries) => {
                for (item, entry) in items.iter().zip(entries) {
                    item.deliver(entry, &self.transformers);
                }
                fail_all(items, missing_result());
            }
            rejection @ Value::Object(_) => {
                for item in items {
                    item.deliver(rejection.clone(), &self.transformers);
                }
            }
            _ => fail_all(
                items,
                ClientError::transport("Batch response is neither an array nor an object"),
            ),
        }
    }
}

fn missing_result() -> ClientError {
    ClientError::transport("Missing result")
}

/// Error every item not yet answered. Answered items are already closed
/// and ignore it.
fn fail_all(items: &[Arc<BatchItem>], error: ClientError) {
    for item in items {
        item.subscriber.error(error.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::link::LinkChain;
    use crate::client::transport::LocalTransport;
    use crate::observable::Observer;
    use crate::server::{ProcedureBuilder, Router, Server};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use futures::{FutureExt, StreamExt};
    use serde_json::json;
    use std::collections::HashMap;

    fn server() -> Server {
        let router = Router::builder()
            .register(
                "double",
                ProcedureBuilder::new().query(|n: i64, _| async move { Ok(n * 2) }),
            )
            .unwrap()
            .register(
                "sleep",
                ProcedureBuilder::new().query(|ms: u64, _| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                }),
            )
            .unwrap()
            .build();
        Server::builder(router).max_batch_size(3).build()
    }

    /// Records every request body and abort signal before forwarding.
    #[derive(Clone)]
    struct Recording {
        inner: LocalTransport,
        bodies: Arc<Mutex<Vec<Value>>>,
        signals: Arc<Mutex<Vec<CancellationToken>>>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                inner: LocalTransport::new(server()),
                bodies: Arc::default(),
                signals: Arc::default(),
            }
        }
    }

    impl Transport for Recording {
        fn send(
            &self,
            request: RawRequest,
            signal: CancellationToken,
        ) -> BoxFuture<'static, crate::error::Result<TransportResponse>> {
            self.bodies
                .lock()
                .push(serde_json::from_slice(&request.body).unwrap());
            self.signals.lock().push(signal.clone());
            self.inner.send(request, signal)
        }
    }

    /// Answers every request with a fixed body.
    struct Canned(&'static str);

    impl Transport for Canned {
        fn send(
            &self,
            _request: RawRequest,
            _signal: CancellationToken,
        ) -> BoxFuture<'static, crate::error::Result<TransportResponse>> {
            let body = Bytes::from_static(self.0.as_bytes());
            async move {
                Ok(TransportResponse {
                    status: 200,
                    metadata: HashMap::new(),
                    body: futures::stream::once(async move { Ok(body) }).boxed(),
                })
            }
            .boxed()
        }
    }

    fn chain(link: BatchLink) -> LinkChain {
        LinkChain::new(vec![Arc::new(link) as Arc<dyn Link>])
    }

    fn query(id: u64, path: &str, input: Value) -> Operation {
        Operation::new(id, ProcedureKind::Query, path, input)
    }

    async fn first(chain: &LinkChain, op: Operation) -> Result<Value, ClientError> {
        match chain.execute(op).first_value().await {
            Some(result) => result.map(|r| r.data),
            None => panic!("completed without a value"),
        }
    }

    #[tokio::test]
    async fn test_same_tick_shares_one_request() {
        let transport = Recording::new();
        let chain = chain(BatchLink::new(transport.clone()));

        let (a, b, c) = tokio::join!(
            first(&chain, query(1, "double", json!(1))),
            first(&chain, query(2, "double", json!(2))),
            first(&chain, query(3, "missing", Value::Null)),
        );
        assert_eq!(a.unwrap(), json!(2));
        assert_eq!(b.unwrap(), json!(4));
        assert_eq!(c.unwrap_err().kind(), ErrorKind::NotFound);

        let bodies = transport.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].as_array().map(Vec::len), Some(3));
        assert_eq!(bodies[0][1]["input"], 2);
    }

    #[tokio::test]
    async fn test_splits_by_max_items() {
        let transport = Recording::new();
        let config = BatchLinkConfig {
            max_items: 2,
            ..BatchLinkConfig::default()
        };
        let chain = chain(BatchLink::builder(transport.clone()).config(config).build());

        let results = futures::future::join_all(
            (0..5).map(|i| first(&chain, query(i, "double", json!(i)))),
        )
        .await;
        let values: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![json!(0), json!(2), json!(4), json!(6), json!(8)]);
        assert_eq!(transport.bodies.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_mutations_batched_separately() {
        let transport = Recording::new();
        let chain = chain(BatchLink::new(transport.clone()));
        let mutation = Operation::new(2, ProcedureKind::Mutation, "double", json!(1));

        let (a, b) = tokio::join!(
            first(&chain, query(1, "double", json!(1))),
            first(&chain, mutation),
        );
        assert!(a.is_ok());
        // "double" is a query, so the mutation is refused by the server.
        assert_eq!(b.unwrap_err().kind(), ErrorKind::MethodNotSupported);
        assert_eq!(transport.bodies.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_results_arrive_in_completion_order() {
        let link = BatchLink::builder(Recording::new())
            .mode(BatchMode::Streamed)
            .build();
        let chain = chain(link);
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls = [30u64, 10, 20].into_iter().enumerate().map(|(i, ms)| {
            let order = order.clone();
            chain
                .execute(query(i as u64, "sleep", json!(ms)))
                .inspect(move |_| order.lock().push(i))
                .first_value()
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(*order.lock(), vec![1, 2, 0]);
        let values: Vec<Value> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().data)
            .collect();
        assert_eq!(values, vec![json!(30), json!(10), json!(20)]);
    }

    #[tokio::test]
    async fn test_server_rejection_applies_to_every_item() {
        let chain = chain(BatchLink::new(Recording::new()));
        let results = futures::future::join_all(
            (0..4).map(|i| first(&chain, query(i, "double", json!(i)))),
        )
        .await;
        for result in results {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::PayloadTooLarge);
        }
    }

    #[tokio::test]
    async fn test_missing_result() {
        let chain = chain(BatchLink::new(Canned(
            r#"[{"result":{"type":"data","data":7}}]"#,
        )));
        let (a, b) = tokio::join!(
            first(&chain, query(1, "x", Value::Null)),
            first(&chain, query(2, "y", Value::Null)),
        );
        assert_eq!(a.unwrap(), json!(7));
        let err = b.unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(err.message(), "Missing result");
    }

    #[tokio::test]
    async fn test_unparseable_response_is_transport_failure() {
        let chain = chain(BatchLink::new(Canned("<html>")));
        let err = first(&chain, query(1, "x", Value::Null)).await.unwrap_err();
        assert!(err.is_transport_failure());
    }

    #[tokio::test]
    async fn test_subscription_rejected() {
        let chain = chain(BatchLink::new(Canned("[]")));
        let op = Operation::new(1, ProcedureKind::Subscription, "feed", Value::Null);
        let err = first(&chain, op).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotSupported);
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let config = BatchLinkConfig {
            max_pending: 1,
            ..BatchLinkConfig::default()
        };
        let chain = chain(BatchLink::builder(Canned("[]")).config(config).build());

        let _held = chain
            .execute(query(1, "x", Value::Null))
            .subscribe(Observer::new());
        let err = first(&chain, query(2, "y", Value::Null)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooManyRequests);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_is_dropped() {
        let transport = Recording::new();
        let chain = chain(BatchLink::new(transport.clone()));

        let dropped = chain
            .execute(query(1, "double", json!(1)))
            .subscribe(Observer::new());
        dropped.unsubscribe();
        let kept = first(&chain, query(2, "double", json!(2))).await;

        assert_eq!(kept.unwrap(), json!(4));
        let bodies = transport.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_aborted_only_when_all_cancelled() {
        let transport = Recording::new();
        let chain = chain(BatchLink::new(transport.clone()));

        let a = chain
            .execute(query(1, "sleep", json!(1000)))
            .subscribe(Observer::new());
        let b = chain
            .execute(query(2, "sleep", json!(1000)))
            .subscribe(Observer::new());
        while transport.signals.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let signal = transport.signals.lock()[0].clone();

        a.unsubscribe();
        assert!(!signal.is_cancelled());
        b.unsubscribe();
        assert!(signal.is_cancelled());
    }
}
