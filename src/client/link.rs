//! The link chain.
//!
//! A client is an ordered list of links. Each link receives the operation
//! and a [`LinkNext`] handle to the rest of the chain; it may forward the
//! operation (possibly modified), answer it itself, or both. The last link
//! must terminate the chain by talking to a transport.

use std::sync::Arc;

use crate::codec::Transformers;
use crate::envelope::{Operation, OperationResponse, ResponseEnvelope, ResultPayload};
use crate::observable::Observable;
use crate::rpc_error::{ClientError, ErrorKind};

/// Results of one operation as seen by a link.
pub type OperationStream = Observable<OperationResponse, ClientError>;

/// One stage of the client chain.
pub trait Link: Send + Sync + 'static {
    fn call(&self, op: Operation, next: LinkNext) -> OperationStream;
}

impl<F> Link for F
where
    F: Fn(Operation, LinkNext) -> OperationStream + Send + Sync + 'static,
{
    fn call(&self, op: Operation, next: LinkNext) -> OperationStream {
        self(op, next)
    }
}

/// Wrap a closure as a shareable link.
pub fn link_fn<F>(f: F) -> Arc<dyn Link>
where
    F: Fn(Operation, LinkNext) -> OperationStream + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The remainder of the chain after the current link.
#[derive(Clone)]
pub struct LinkNext {
    chain: Arc<[Arc<dyn Link>]>,
    position: usize,
}

impl LinkNext {
    /// Hand `op` to the next link.
    ///
    /// Past the end of the chain this fails with `INTERNAL_SERVER_ERROR`,
    /// which means the chain has no terminating link.
    pub fn run(&self, op: Operation) -> OperationStream {
        match self.chain.get(self.position) {
            Some(link) => link.call(
                op,
                LinkNext {
                    chain: self.chain.clone(),
                    position: self.position + 1,
                },
            ),
            None => Observable::failed(ClientError::client(
                ErrorKind::Internal,
                format!("No terminating link for operation on path {}", op.path),
            )),
        }
    }
}

/// An ordered, immutable chain of links.
#[derive(Clone)]
pub struct LinkChain {
    links: Arc<[Arc<dyn Link>]>,
}

impl LinkChain {
    pub fn new(links: Vec<Arc<dyn Link>>) -> Self {
        Self {
            links: links.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run `op` through the chain from the first link.
    pub fn execute(&self, op: Operation) -> OperationStream {
        LinkNext {
            chain: self.links.clone(),
            position: 0,
        }
        .run(op)
    }
}

impl std::fmt::Debug for LinkChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkChain")
            .field("links", &self.links.len())
            .finish()
    }
}

/// Translate a response envelope into what a link delivers.
///
/// `Ok(None)` means the envelope carries no value (`started`, `stopped`).
/// Error envelopes become server-origin [`ClientError`]s with the shape
/// passed through the output transformer.
pub(crate) fn decode_envelope(
    envelope: ResponseEnvelope,
    streaming: bool,
    transformers: &Transformers,
) -> Result<Option<OperationResponse>, ClientError> {
    match envelope.result {
        ResultPayload::Data { data } => {
            let data = transformers.output.deserialize(data).map_err(|e| {
                ClientError::transport(format!("Unable to transform response data: {e}"))
            })?;
            Ok(Some(if streaming {
                OperationResponse::stream_item(data)
            } else {
                OperationResponse::single(data)
            }))
        }
        ResultPayload::Error { error } => {
            let shape = transformers
                .output
                .deserialize(error.clone())
                .unwrap_or(error);
            Err(ClientError::from_shape(shape))
        }
        ResultPayload::Started | ResultPayload::Stopped => Ok(None),
    }
}

/// Serialize an operation's input for the wire.
pub(crate) fn encode_input(
    op: &Operation,
    transformers: &Transformers,
) -> Result<serde_json::Value, ClientError> {
    transformers.input.serialize(op.input.clone()).map_err(|e| {
        ClientError::client(
            ErrorKind::BadInput,
            format!("Unable to transform input for {}: {e}", op.path),
        )
    })
}
