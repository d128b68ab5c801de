use std::sync::Arc;

use crate::client::link::{decode_envelope, encode_input, Link, LinkNext, OperationStream};
use crate::codec::Transformers;
use crate::context::Context;
use crate::envelope::{Operation, ProcedureKind, ResponseEnvelope, ResultPayload};
use crate::observable::{Observable, Observer, Subscription, Teardown};
use crate::rpc_error::ClientError;
use crate::server::Server;

type ContextFactory = Arc<dyn Fn(&Operation) -> Context + Send + Sync>;

/// Terminal link calling a [`Server`] in the same process.
///
/// Handles every operation kind. Values still pass through the
/// transformers, but no bytes are produced.
#[derive(Clone)]
pub struct LocalLink {
    server: Server,
    transformers: Transformers,
    context: ContextFactory,
}

impl LocalLink {
    /// Uses the server's own transformers.
    pub fn new(server: Server) -> Self {
        let transformers = server.config().transformers.clone();
        Self {
            server,
            transformers,
            context: Arc::new(|_| Context::new()),
        }
    }

    /// Build the initial context of each call from its operation.
    pub fn with_context<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Operation) -> Context + Send + Sync + 'static,
    {
        self.context = Arc::new(factory);
        self
    }

    fn call_once(&self, op: Operation) -> OperationStream {
        let link = self.clone();
        Observable::new(move |subscriber| {
            let input = match encode_input(&op, &link.transformers) {
                Ok(input) => input,
                Err(error) => {
                    subscriber.error(error);
                    return Teardown::noop();
                }
            };

            let signal = op.signal.child_token();
            let call_signal = signal.clone();
            let (server, transformers) = (link.server.clone(), link.transformers.clone());
            let request = op.to_wire(input);
            let ctx = (link.context)(&op);
            tokio::spawn(async move {
                let envelope = server.respond(request, ctx, call_signal).await;
                match decode_envelope(envelope, false, &transformers) {
                    Ok(Some(response)) => {
                        subscriber.next(response);
                        subscriber.complete();
                    }
                    Ok(None) => subscriber.error(ClientError::transport("Response carried no result")),
                    Err(error) => subscriber.error(error),
                }
            });

            Teardown::new(move || signal.cancel())
        })
    }

    fn subscribe(&self, op: Operation) -> OperationStream {
        let link = self.clone();
        Observable::new(move |subscriber| {
            let input = match encode_input(&op, &link.transformers) {
                Ok(input) => input,
                Err(error) => {
                    subscriber.error(error);
                    return Teardown::noop();
                }
            };

            let envelopes = link.server.subscribe(op.to_wire(input), (link.context)(&op));
            let transformers = link.transformers.clone();
            let (on_envelope, on_done) = (subscriber.clone(), subscriber);
            let upstream: Subscription = envelopes.subscribe(
                Observer::new()
                    .on_next(move |envelope: ResponseEnvelope| {
                        if matches!(envelope.result, ResultPayload::Stopped) {
                            on_envelope.complete();
                            return;
                        }
                        match decode_envelope(envelope, true, &transformers) {
                            Ok(Some(response)) => on_envelope.next(response),
                            Ok(None) => {}
                            Err(error) => on_envelope.error(error),
                        }
                    })
                    .on_complete(move || on_done.complete()),
            );

            upstream.into()
        })
    }
}

impl Link for LocalLink {
    fn call(&self, op: Operation, _next: LinkNext) -> OperationStream {
        match op.kind {
            ProcedureKind::Subscription => self.subscribe(op),
            ProcedureKind::Query | ProcedureKind::Mutation => self.call_once(op),
        }
    }
}

impl std::fmt::Debug for LocalLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLink").finish_non_exhaustive()
    }
}
