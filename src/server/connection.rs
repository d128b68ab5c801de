//! Persistent-connection transport binding.
//!
//! One connection carries many concurrent calls, each addressed by the
//! `request_id` of its frames:
//!
//! ```text
//! client                                   server
//! Request  id=7 {"path","type":"query"} ─►
//!                                       ◄─ Response id=7 flags=0        {"result":{"type":"data",..}}
//! Request  id=8 {"type":"subscription"} ─►
//!                                       ◄─ Response id=8 STARTED        {"result":{"type":"started"}}
//!                                       ◄─ Response id=8 IS_STREAM      {"result":{"type":"data",..}}
//! Abort    id=8                         ─►
//! ```
//!
//! A subscription ends with a `STREAM_END` frame (`stopped`, or an error
//! envelope with `IS_ERROR`), unless the client aborted it. When the
//! connection closes every running call is cancelled and every active
//! subscription torn down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::engine::Server;
use crate::codec::PayloadCodec;
use crate::context::Context;
use crate::envelope::{ProcedureKind, ResponseEnvelope, ResultPayload, WireRequest};
use crate::error::Result;
use crate::protocol::{flags, Frame, FrameBuffer, FrameKind, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::rpc_error::{ErrorKind, NormalizedError};
use crate::writer::{
    spawn_writer_task, WriterConfig, WriterHandle, DEFAULT_BACKPRESSURE_TIMEOUT,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES,
};

/// Default maximum number of calls running at once on one connection.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection limits and payload encoding.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout: Duration,
    /// Requests beyond this are answered with `TOO_MANY_REQUESTS`.
    pub max_concurrent_calls: usize,
    pub max_payload_size: u32,
    pub codec: PayloadCodec,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            codec: PayloadCodec::default(),
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: self.backpressure_timeout,
        }
    }
}

/// Response flags for an envelope.
pub(crate) fn envelope_flags(envelope: &ResponseEnvelope, streaming: bool) -> u8 {
    match (&envelope.result, streaming) {
        (ResultPayload::Started, _) => flags::STARTED,
        (ResultPayload::Stopped, _) => flags::IS_STREAM | flags::STREAM_END,
        (ResultPayload::Data { .. }, true) => flags::IS_STREAM,
        (ResultPayload::Data { .. }, false) => 0,
        (ResultPayload::Error { .. }, true) => flags::IS_STREAM | flags::STREAM_END | flags::IS_ERROR,
        (ResultPayload::Error { .. }, false) => flags::IS_ERROR,
    }
}

struct ActiveCall {
    serial: u64,
    token: CancellationToken,
}

struct Connection {
    server: Server,
    ctx: Context,
    codec: PayloadCodec,
    writer: WriterHandle,
    semaphore: Arc<Semaphore>,
    calls: Mutex<HashMap<u32, ActiveCall>>,
    next_serial: AtomicU64,
    closed: CancellationToken,
}

/// Serve calls arriving on `io` until the peer closes it.
///
/// `ctx` is the initial context of every call on this connection.
pub async fn serve_connection<S>(
    server: Server,
    io: S,
    ctx: Context,
    config: ConnectionConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, write_half) = tokio::io::split(io);
    let (writer, writer_task) = spawn_writer_task(write_half, config.writer_config());

    let connection = Arc::new(Connection {
        server,
        ctx,
        codec: config.codec,
        writer,
        semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
        calls: Mutex::new(HashMap::new()),
        next_serial: AtomicU64::new(0),
        closed: CancellationToken::new(),
    });

    debug!("connection opened");
    let result = read_loop(reader, &connection, config.max_payload_size).await;
    if let Err(e) = &result {
        warn!(error = %e, "connection read failed");
    }

    connection.closed.cancel();
    let active: Vec<ActiveCall> = connection.calls.lock().drain().map(|(_, call)| call).collect();
    debug!(active = active.len(), "connection closed");
    for call in active {
        call.token.cancel();
    }

    drop(connection);
    match writer_task.await {
        Ok(Err(e)) => debug!(error = %e, "writer stopped with an error"),
        Err(e) => error!(error = %e, "writer task failed"),
        Ok(Ok(())) => {}
    }
    result
}

async fn read_loop<R>(mut reader: R, connection: &Arc<Connection>, max_payload: u32) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for frame in frames.push(&buf[..n])? {
            connection.dispatch(frame).await;
        }
    }
}

impl Connection {
    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let id = frame.request_id();
        match frame.kind() {
            FrameKind::Abort => {
                let call = self.calls.lock().remove(&id);
                if let Some(call) = call {
                    debug!(request_id = id, "call aborted by peer");
                    call.token.cancel();
                }
            }
            FrameKind::Response => {
                warn!(request_id = id, "ignoring response frame sent to a server");
            }
            FrameKind::Request => self.start_call(id, frame).await,
        }
    }

    async fn start_call(self: &Arc<Self>, id: u32, frame: Frame) {
        let request: WireRequest = match self.codec.decode(frame.payload()) {
            Ok(request) => request,
            Err(e) => {
                let error = NormalizedError::new(
                    ErrorKind::ParseError,
                    format!("Malformed request frame: {e}"),
                );
                return self.reject(id, None, error).await;
            }
        };

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(request_id = id, path = %request.path, "call capacity reached");
                let error =
                    NormalizedError::new(ErrorKind::TooManyRequests, "Too many concurrent calls");
                return self.reject(id, Some(&request), error).await;
            }
        };

        let token = self.closed.child_token();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let duplicate = {
            let mut calls = self.calls.lock();
            let taken = calls.contains_key(&id);
            if !taken {
                calls.insert(
                    id,
                    ActiveCall {
                        serial,
                        token: token.clone(),
                    },
                );
            }
            taken
        };
        if duplicate {
            let error = NormalizedError::new(
                ErrorKind::Conflict,
                format!("Request id {id} is already in use"),
            );
            return self.reject(id, Some(&request), error).await;
        }

        let connection = self.clone();
        match request.kind {
            ProcedureKind::Subscription => {
                tokio::spawn(connection.run_subscription(id, serial, request, token, permit));
            }
            ProcedureKind::Query | ProcedureKind::Mutation => {
                tokio::spawn(connection.run_call(id, serial, request, token, permit));
            }
        }
    }

    async fn run_call(
        self: Arc<Self>,
        id: u32,
        serial: u64,
        request: WireRequest,
        token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let envelope = self
            .server
            .respond(request, self.ctx.clone(), token.clone())
            .await;
        self.finish(id, serial);
        if !token.is_cancelled() {
            self.send(id, &envelope, false).await;
        }
    }

    async fn run_subscription(
        self: Arc<Self>,
        id: u32,
        serial: u64,
        request: WireRequest,
        token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let mut envelopes = self.server.subscribe(request, self.ctx.clone()).into_stream();

        loop {
            let envelope = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = envelopes.next() => match item {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(never)) => match never {},
                    None => break,
                },
            };

            let last = matches!(
                envelope.result,
                ResultPayload::Stopped | ResultPayload::Error { .. }
            );
            if !self.send(id, &envelope, true).await || last {
                break;
            }
        }

        drop(envelopes);
        self.finish(id, serial);
    }

    fn finish(&self, id: u32, serial: u64) {
        let mut calls = self.calls.lock();
        if calls.get(&id).is_some_and(|call| call.serial == serial) {
            calls.remove(&id);
        }
    }

    async fn reject(&self, id: u32, request: Option<&WireRequest>, error: NormalizedError) {
        let path = request.map(|r| r.path.as_str());
        let kind = request.map(|r| r.kind);
        self.server.report(&error, path);
        let envelope = self
            .server
            .error_envelope(&error, path, kind)
            .with_id(request.and_then(|r| r.id));
        let streaming = kind == Some(ProcedureKind::Subscription);
        self.send(id, &envelope, streaming).await;
    }

    /// Encode and queue one response frame. Returns false if the
    /// connection can no longer take frames.
    async fn send(&self, id: u32, envelope: &ResponseEnvelope, streaming: bool) -> bool {
        let payload = match self.codec.encode(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(request_id = id, error = %e, "failed to encode response");
                return true;
            }
        };
        let frame = Frame::response(id, envelope_flags(envelope, streaming), payload);
        match self.writer.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!(request_id = id, error = %e, "dropping response");
                false
            }
        }
    }
}
