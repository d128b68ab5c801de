use std::sync::Arc;

use crate::client::link::{decode_envelope, encode_input, Link, LinkNext, OperationStream};
use crate::client::transport::Transport;
use crate::codec::Transformers;
use crate::envelope::{Operation, ProcedureKind, RawRequest, ResponseEnvelope};
use crate::observable::{Observable, Teardown};
use crate::rpc_error::{ClientError, ErrorKind};

/// Terminal link sending each query or mutation as its own request.
#[derive(Clone)]
pub struct RequestLink {
    transport: Arc<dyn Transport>,
    transformers: Transformers,
}

impl RequestLink {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
            transformers: Transformers::default(),
        }
    }

    pub fn transformers(mut self, transformers: Transformers) -> Self {
        self.transformers = transformers;
        self
    }
}

impl Link for RequestLink {
    fn call(&self, op: Operation, _next: LinkNext) -> OperationStream {
        if op.kind == ProcedureKind::Subscription {
            return Observable::failed(ClientError::client(
                ErrorKind::MethodNotSupported,
                format!("Subscription {} needs a subscription-capable link", op.path),
            ));
        }

        let (transport, transformers) = (self.transport.clone(), self.transformers.clone());
        Observable::new(move |subscriber| {
            let input = match encode_input(&op, &transformers) {
                Ok(input) => input,
                Err(error) => {
                    subscriber.error(error);
                    return Teardown::noop();
                }
            };
            let body = match serde_json::to_vec(&op.to_wire(input)) {
                Ok(body) => body,
                Err(e) => {
                    subscriber.error(ClientError::transport(format!(
                        "Unable to encode request: {e}"
                    )));
                    return Teardown::noop();
                }
            };

            let signal = op.signal.child_token();
            let request = transport.send(RawRequest::new(body), signal.clone());
            let transformers = transformers.clone();
            tokio::spawn(async move {
                let outcome = match request.await {
                    Ok(response) => match response.collect_body().await {
                        Ok(body) => serde_json::from_slice::<ResponseEnvelope>(&body)
                            .map_err(|e| {
                                ClientError::transport(format!("Unable to parse response: {e}"))
                            })
                            .and_then(|envelope| decode_envelope(envelope, false, &transformers)),
                        Err(e) => Err(e.into()),
                    },
                    Err(e) => Err(e.into()),
                };
                match outcome {
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
}

impl std::fmt::Debug for RequestLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::link::LinkChain;
    use crate::client::transport::LocalTransport;
    use crate::codec::testing::Wrapping;
    use crate::server::{ProcedureBuilder, Router, Server};
    use serde_json::{json, Value};

    fn chain(transformers: Transformers) -> LinkChain {
        let router = Router::builder()
            .register(
                "len",
                ProcedureBuilder::new().query(|s: String, _| async move { Ok(s.len()) }),
            )
            .unwrap()
            .build();
        let server = Server::builder(router).transformer(transformers.clone()).build();
        let link = RequestLink::new(LocalTransport::new(server)).transformers(transformers);
        LinkChain::new(vec![Arc::new(link) as Arc<dyn Link>])
    }

    async fn call(chain: &LinkChain, kind: ProcedureKind, input: Value) -> Result<Value, ClientError> {
        chain
            .execute(Operation::new(1, kind, "len", input))
            .first_value()
            .await
            .map(|r| r.map(|r| r.data))
            .unwrap_or_else(|| Err(ClientError::transport("no value")))
    }

    #[tokio::test]
    async fn test_single_request() {
        let chain = chain(Transformers::default());
        assert_eq!(call(&chain, ProcedureKind::Query, json!("abc")).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_transformers_on_both_ends() {
        let chain = chain(Transformers::uniform(Wrapping));
        assert_eq!(call(&chain, ProcedureKind::Query, json!("abcd")).await.unwrap(), json!(4));

        let err = call(&chain, ProcedureKind::Query, json!(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_subscription_rejected() {
        let chain = chain(Transformers::default());
        let err = call(&chain, ProcedureKind::Subscription, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotSupported);
    }
}
