//! Terminal link over a persistent framed connection.
//!
//! Every operation gets a request id on the connection. Responses are
//! routed back by id; a subscription stays registered until a `STREAM_END`
//! frame arrives or the caller unsubscribes, which sends an `Abort` frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::link::{decode_envelope, encode_input, Link, LinkNext, OperationStream};
use crate::codec::{PayloadCodec, Transformers};
use crate::envelope::{Operation, OperationResponse, ResponseEnvelope};
use crate::error::Result;
use crate::observable::{Observable, Subscriber, Teardown};
use crate::protocol::{flags, Frame, FrameBuffer, FrameKind};
use crate::rpc_error::ClientError;
use crate::server::ConnectionConfig;
use crate::writer::{spawn_writer_task, WriterHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

type Caller = Subscriber<OperationResponse, ClientError>;

/// Calls waiting for responses, shared with the read task.
struct Calls {
    pending: Mutex<HashMap<u32, Caller>>,
    closed: CancellationToken,
}

struct Outbound {
    writer: WriterHandle,
    codec: PayloadCodec,
    transformers: Transformers,
    calls: Arc<Calls>,
    next_id: AtomicU32,
}

/// Terminal link multiplexing every operation kind over one connection
/// served by [`serve_connection`](crate::server::serve_connection).
///
/// Writes never wait: when the writer is saturated the operation fails
/// with `TRANSPORT_FAILURE`. Losing the connection fails every pending
/// operation the same way.
#[derive(Clone)]
pub struct ConnectionLink {
    inner: Arc<Outbound>,
}

impl ConnectionLink {
    /// Start the read and write tasks over `io`. Must be called within a
    /// tokio runtime.
    pub fn new<S>(io: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_transformers(io, config, Transformers::default())
    }

    pub fn with_transformers<S>(io: S, config: ConnectionConfig, transformers: Transformers) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(io);
        let (writer, _writer_task) = spawn_writer_task(write_half, config.writer_config());

        let calls = Arc::new(Calls {
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_loop(
            reader,
            calls.clone(),
            config.codec,
            transformers.clone(),
            config.max_payload_size,
        ));

        Self {
            inner: Arc::new(Outbound {
                writer,
                codec: config.codec,
                transformers,
                calls,
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Connect to a unix socket served by
    /// [`serve_socket`](crate::transport::serve_socket).
    #[cfg(unix)]
    pub async fn connect_socket(
        path: impl AsRef<std::path::Path>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream, config))
    }

    /// Stop reading; pending operations fail with `TRANSPORT_FAILURE`.
    pub fn close(&self) {
        self.inner.calls.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.calls.closed.is_cancelled()
    }

    /// Operations waiting for a response.
    pub fn pending(&self) -> usize {
        self.inner.calls.pending.lock().len()
    }
}

impl Outbound {
    /// Register `caller` under a fresh request id, unless the connection
    /// is already closed.
    fn register(&self, caller: Caller) -> Option<u32> {
        let mut pending = self.calls.pending.lock();
        if self.calls.closed.is_cancelled() {
            return None;
        }
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !pending.contains_key(&id) {
                pending.insert(id, caller);
                return Some(id);
            }
        }
    }

    /// Drop a call the caller gave up on, telling the server to stop it.
    fn abort(&self, id: u32) {
        let removed = self.calls.pending.lock().remove(&id).is_some();
        if removed && !self.calls.closed.is_cancelled() {
            debug!(request_id = id, "aborting call");
            if let Err(e) = self.writer.try_send(Frame::abort(id)) {
                debug!(request_id = id, error = %e, "unable to send abort");
            }
        }
    }
}

impl Link for ConnectionLink {
    fn call(&self, op: Operation, _next: LinkNext) -> OperationStream {
        let outbound = self.inner.clone();
        Observable::new(move |subscriber| {
            let payload = encode_input(&op, &outbound.transformers).and_then(|input| {
                outbound
                    .codec
                    .encode(&op.to_wire(input))
                    .map_err(|e| ClientError::transport(format!("Unable to encode request: {e}")))
            });
            let payload = match payload {
                Ok(payload) => payload,
                Err(error) => {
                    subscriber.error(error);
                    return Teardown::noop();
                }
            };

            let Some(id) = outbound.register(subscriber.clone()) else {
                subscriber.error(ClientError::transport("Connection closed"));
                return Teardown::noop();
            };
            if let Err(e) = outbound.writer.try_send(Frame::request(id, payload)) {
                outbound.calls.pending.lock().remove(&id);
                subscriber.error(e.into());
                return Teardown::noop();
            }

            let outbound = outbound.clone();
            Teardown::new(move || outbound.abort(id))
        })
    }
}

impl std::fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("codec", &self.inner.codec)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    mut reader: R,
    calls: Arc<Calls>,
    codec: PayloadCodec,
    transformers: Transformers,
    max_payload: u32,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let result: Result<()> = loop {
        let n = tokio::select! {
            _ = calls.closed.cancelled() => break Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            },
        };
        if n == 0 {
            break Ok(());
        }
        match frames.push(&buf[..n]) {
            Ok(batch) => {
                for frame in batch {
                    calls.dispatch(frame, codec, &transformers);
                }
            }
            Err(e) => break Err(e),
        }
    };
    if let Err(e) = &result {
        warn!(error = %e, "connection read failed");
    }

    let orphaned: Vec<Caller> = {
        let mut pending = calls.pending.lock();
        calls.closed.cancel();
        pending.drain().map(|(_, caller)| caller).collect()
    };
    debug!(pending = orphaned.len(), "connection closed");
    for caller in orphaned {
        caller.error(ClientError::transport("Connection closed"));
    }
}

impl Calls {
    fn dispatch(&self, frame: Frame, codec: PayloadCodec, transformers: &Transformers) {
        let id = frame.request_id();
        if frame.kind() != FrameKind::Response {
            warn!(request_id = id, kind = ?frame.kind(), "ignoring frame sent to a client");
            return;
        }

        let Some(caller) = self.pending.lock().get(&id).cloned() else {
            debug!(request_id = id, "response for an unknown call");
            return;
        };

        let envelope: ResponseEnvelope = match codec.decode(frame.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.pending.lock().remove(&id);
                caller.error(ClientError::transport(format!(
                    "Malformed response frame: {e}"
                )));
                return;
            }
        };

        let started = flags::has_flag(frame.flags(), flags::STARTED);
        let last = frame.is_stream_end() || (!frame.is_stream() && !started);
        if last {
            self.pending.lock().remove(&id);
        }

        match decode_envelope(envelope, frame.is_stream(), transformers) {
            Ok(Some(response)) => {
                caller.next(response);
                if last {
                    caller.complete();
                }
            }
            Ok(None) if last => caller.complete(),
            Ok(None) => {}
            Err(error) => caller.error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::link::LinkChain;
    use crate::context::Context;
    use crate::envelope::ProcedureKind;
    use crate::rpc_error::{ErrorKind, NormalizedError};
    use crate::server::{serve_connection, ProcedureBuilder, Router, Server};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::duplex;

    fn server(torn_down: Arc<AtomicUsize>) -> Server {
        let router = Router::builder()
            .register(
                "double",
                ProcedureBuilder::new().query(|n: i64, _| async move { Ok(n * 2) }),
            )
            .unwrap()
            .register(
                "count",
                ProcedureBuilder::new().subscription_stream(|n: u32, _| {
                    futures::stream::iter((1..=n).map(Ok::<_, NormalizedError>))
                }),
            )
            .unwrap()
            .register(
                "forever",
                ProcedureBuilder::new().subscription(move |_: (), _| {
                    let torn_down = torn_down.clone();
                    async move {
                        Ok(Observable::<u32, NormalizedError>::new(move |s| {
                            s.next(1);
                            let torn_down = torn_down.clone();
                            Teardown::new(move || {
                                torn_down.fetch_add(1, Ordering::SeqCst);
                            })
                        }))
                    }
                }),
            )
            .unwrap()
            .build();
        Server::new(router)
    }

    fn connect(config: ConnectionConfig, torn_down: Arc<AtomicUsize>) -> (LinkChain, ConnectionLink) {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(serve_connection(
            server(torn_down),
            server_io,
            Context::new(),
            config.clone(),
        ));
        let link = ConnectionLink::new(client_io, config);
        (
            LinkChain::new(vec![Arc::new(link.clone()) as Arc<dyn Link>]),
            link,
        )
    }

    fn op(kind: ProcedureKind, path: &str, input: Value) -> Operation {
        Operation::new(1, kind, path, input)
    }

    #[tokio::test]
    async fn test_queries_with_both_codecs() {
        for codec in [PayloadCodec::Json, PayloadCodec::MsgPack] {
            let config = ConnectionConfig {
                codec,
                ..ConnectionConfig::default()
            };
            let (chain, link) = connect(config, Arc::default());

            let calls = (0..5).map(|i| chain.execute(op(ProcedureKind::Query, "double", json!(i))).first_value());
            let results = futures::future::join_all(calls).await;
            let values: Vec<Value> = results.into_iter().map(|r| r.unwrap().unwrap().data).collect();
            assert_eq!(values, vec![json!(0), json!(2), json!(4), json!(6), json!(8)]);
            assert_eq!(link.pending(), 0);
        }
    }

    #[tokio::test]
    async fn test_server_error() {
        let (chain, _link) = connect(ConnectionConfig::default(), Arc::default());
        let err = chain
            .execute(op(ProcedureKind::Query, "double", json!("x")))
            .first_value()
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_subscription_completes() {
        let (chain, link) = connect(ConnectionConfig::default(), Arc::default());
        let items: Vec<_> = chain
            .execute(op(ProcedureKind::Subscription, "count", json!(3)))
            .into_stream()
            .collect()
            .await;
        let data: Vec<Value> = items.into_iter().map(|r| r.unwrap().data).collect();
        assert_eq!(data, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(link.pending(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_aborts_server_subscription() {
        let torn_down = Arc::new(AtomicUsize::new(0));
        let (chain, link) = connect(ConnectionConfig::default(), torn_down.clone());

        let mut stream = chain
            .execute(op(ProcedureKind::Subscription, "forever", Value::Null))
            .into_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, json!(1));
        assert!(first.streaming);

        drop(stream);
        assert_eq!(link.pending(), 0);
        for _ in 0..100 {
            if torn_down.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let (client_io, server_io) = duplex(1024);
        let link = ConnectionLink::new(client_io, ConnectionConfig::default());
        let chain = LinkChain::new(vec![Arc::new(link.clone()) as Arc<dyn Link>]);

        let call = chain
            .execute(op(ProcedureKind::Query, "double", json!(1)))
            .first_value();
        let closer = async move {
            while link.pending() == 0 {
                tokio::task::yield_now().await;
            }
            drop(server_io);
        };
        let (result, ()) = tokio::join!(call, closer);
        let err = result.unwrap().unwrap_err();
        assert!(err.is_transport_failure());
    }

    #[tokio::test]
    async fn test_closed_link_rejects_new_calls() {
        let (chain, link) = connect(ConnectionConfig::default(), Arc::default());
        link.close();
        while !link.is_closed() {
            tokio::task::yield_now().await;
        }
        let err = chain
            .execute(op(ProcedureKind::Query, "double", json!(1)))
            .first_value()
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_transport_failure());
    }
}
