//! Request/response transports used by the terminal links.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{LinkwireError, Result};
use crate::envelope::RawRequest;
use crate::server::Server;

/// Answer to one request, with a body that may still be arriving.
pub struct TransportResponse {
    pub status: u16,
    pub metadata: HashMap<String, String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl TransportResponse {
    /// Concatenate the whole body.
    pub async fn collect_body(self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Carries one raw request to a server.
///
/// Cancelling `signal` abandons the request; an implementation stops
/// reading the body and fails pending futures with `Aborted`.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: RawRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<TransportResponse>>;
}

type ContextFactory = Arc<dyn Fn() -> Context + Send + Sync>;

/// Transport calling a [`Server`] in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    server: Server,
    context: ContextFactory,
}

impl LocalTransport {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            context: Arc::new(Context::new),
        }
    }

    /// Build the context of every request with `factory`.
    pub fn with_context<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Context + Send + Sync + 'static,
    {
        self.context = Arc::new(factory);
        self
    }
}

impl Transport for LocalTransport {
    fn send(
        &self,
        request: RawRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<TransportResponse>> {
        let server = self.server.clone();
        let ctx = (self.context)();
        async move {
            let response = tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(LinkwireError::Aborted),
                response = server.handle_request(request, ctx) => response,
            };
            let stop = signal.clone();
            let body = response
                .body
                .map(Ok)
                .take_until(async move { stop.cancelled().await })
                .boxed();
            Ok(TransportResponse {
                status: response.status,
                metadata: response.metadata,
                body,
            })
        }
        .boxed()
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport").finish_non_exhaustive()
    }
}
