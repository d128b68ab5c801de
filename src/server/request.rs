//! Request/response transport binding.
//!
//! A body is either one operation object or an array of them (a batch).
//! Batches are answered as a JSON array in request order, or, when the
//! request carries `batch-mode: stream`, in the indexed streaming framing
//! with entries written as each operation completes.

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error};

use super::engine::Server;
use crate::context::Context;
use crate::envelope::{RawRequest, RawResponse, ResponseEnvelope, WireRequest};
use crate::protocol::BatchStreamEncoder;
use crate::rpc_error::{ErrorKind, NormalizedError};

/// Status of a buffered batch whose entries disagree.
pub const MULTI_STATUS: u16 = 207;

type Answer = (u16, ResponseEnvelope);

impl Server {
    /// Answer a raw request.
    ///
    /// Dropping the response body before it is exhausted cancels every
    /// operation still running.
    pub async fn handle_request(&self, request: RawRequest, ctx: Context) -> RawResponse {
        let body: Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(e) => {
                return self.reject(
                    NormalizedError::new(
                        ErrorKind::ParseError,
                        format!("Unable to parse request body: {e}"),
                    )
                    .with_cause(e),
                )
            }
        };

        match body {
            Value::Array(items) if request.wants_stream() => self.stream_batch(items, ctx),
            Value::Array(items) => self.buffered_batch(items, ctx).await,
            item @ Value::Object(_) => {
                let signal = CancellationToken::new();
                let _guard = signal.clone().drop_guard();
                let (status, envelope) = self.answer_item(item, ctx, signal).await;
                RawResponse::full(status, to_json(&envelope))
            }
            _ => self.reject(NormalizedError::new(
                ErrorKind::ParseError,
                "Request body must be an operation or an array of operations",
            )),
        }
    }

    async fn buffered_batch(&self, items: Vec<Value>, ctx: Context) -> RawResponse {
        if let Err(error) = self.check_batch(&items) {
            return self.reject(error);
        }

        let signal = CancellationToken::new();
        let _guard = signal.clone().drop_guard();
        let answers: Vec<Answer> = join_all(
            items
                .into_iter()
                .map(|item| self.answer_item(item, ctx.clone(), signal.child_token())),
        )
        .await;

        let status = batch_status(answers.iter().map(|(status, _)| *status));
        let envelopes: Vec<ResponseEnvelope> =
            answers.into_iter().map(|(_, envelope)| envelope).collect();
        RawResponse::full(status, to_json(&envelopes))
    }

    fn stream_batch(&self, items: Vec<Value>, ctx: Context) -> RawResponse {
        if let Err(error) = self.check_batch(&items) {
            return self.reject(error);
        }

        let signal = CancellationToken::new();
        let pending: FuturesUnordered<BoxFuture<'static, (usize, ResponseEnvelope)>> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let server = self.clone();
                let ctx = ctx.clone();
                let signal = signal.child_token();
                async move { (index, server.answer_item(item, ctx, signal).await.1) }.boxed()
            })
            .collect();

        let state = StreamState {
            pending,
            encoder: Some(BatchStreamEncoder::new()),
            _guard: signal.drop_guard(),
        };

        let body = futures::stream::unfold(state, |mut state| async move {
            let encoder = state.encoder.as_mut()?;
            match state.pending.next().await {
                Some((index, envelope)) => {
                    let chunk = encoder
                        .item(index, &to_value(&envelope))
                        .unwrap_or_else(|e| {
                            error!(index, error = %e, "failed to encode batch entry");
                            Bytes::new()
                        });
                    Some((chunk, state))
                }
                None => {
                    let closing = state.encoder.take()?.finish();
                    Some((closing, state))
                }
            }
        });

        RawResponse::streaming(200, body.boxed())
    }

    async fn answer_item(&self, item: Value, ctx: Context, signal: CancellationToken) -> Answer {
        match serde_json::from_value::<WireRequest>(item) {
            Ok(request) => self.answer(request, ctx, signal).await,
            Err(e) => {
                let error = NormalizedError::new(
                    ErrorKind::ParseError,
                    format!("Malformed operation: {e}"),
                )
                .with_cause(e);
                self.report(&error, None);
                (error.http_status(), self.error_envelope(&error, None, None))
            }
        }
    }

    fn check_batch(&self, items: &[Value]) -> Result<(), NormalizedError> {
        let max = self.config().max_batch_size;
        if items.len() > max {
            return Err(NormalizedError::new(
                ErrorKind::PayloadTooLarge,
                format!("Batch of {} operations exceeds the limit of {max}", items.len()),
            ));
        }
        debug!(size = items.len(), "dispatching batch");
        Ok(())
    }

    fn reject(&self, error: NormalizedError) -> RawResponse {
        self.report(&error, None);
        let envelope = self.error_envelope(&error, None, None);
        RawResponse::full(error.http_status(), to_json(&envelope))
    }
}

struct StreamState {
    pending: FuturesUnordered<BoxFuture<'static, (usize, ResponseEnvelope)>>,
    encoder: Option<BatchStreamEncoder>,
    _guard: DropGuard,
}

/// Common status of all entries, or 207 when they differ.
fn batch_status(mut statuses: impl Iterator<Item = u16>) -> u16 {
    match statuses.next() {
        None => 200,
        Some(first) if statuses.all(|status| status == first) => first,
        Some(_) => MULTI_STATUS,
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize response");
        Value::Null
    })
}

fn to_json<T: Serialize>(value: &T) -> Bytes {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to serialize response");
            Bytes::from_static(b"null")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::BATCH_MODE_KEY;
    use crate::protocol::BatchStreamDecoder;
    use crate::server::{ProcedureBuilder, Router};
    use serde_json::json;
    use std::time::Duration;

    fn server(max_batch: usize) -> Server {
        let router = Router::builder()
            .register(
                "echo",
                ProcedureBuilder::new().query(|v: Value, _| async move { Ok(v) }),
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
            .register(
                "feed",
                ProcedureBuilder::new()
                    .subscription_stream(|_: (), _| futures::stream::empty::<Result<u8, _>>()),
            )
            .unwrap()
            .build();
        Server::builder(router).max_batch_size(max_batch).build()
    }

    async fn body_json(response: RawResponse) -> Value {
        serde_json::from_slice(&response.collect_body().await).unwrap()
    }

    #[tokio::test]
    async fn test_single_request() {
        let req = RawRequest::new(r#"{"path":"echo","type":"query","input":{"x":1}}"#);
        let response = server(10).handle_request(req, Context::new()).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            body_json(response).await,
            json!({"result": {"type": "data", "data": {"x": 1}}})
        );
    }

    #[tokio::test]
    async fn test_parse_error() {
        let response = server(10)
            .handle_request(RawRequest::new("{nope"), Context::new())
            .await;
        assert_eq!(response.status, 400);
        let body = body_json(response).await;
        assert_eq!(body["result"]["error"]["data"]["code"], "PARSE_ERROR");
    }

    #[tokio::test]
    async fn test_scalar_body_rejected() {
        let response = server(10)
            .handle_request(RawRequest::new("42"), Context::new())
            .await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_buffered_batch_mixed_status() {
        let req = RawRequest::new(
            r#"[{"path":"echo","type":"query","input":1},{"path":"missing","type":"query"}]"#,
        );
        let response = server(10).handle_request(req, Context::new()).await;
        assert_eq!(response.status, MULTI_STATUS);
        let body = body_json(response).await;
        assert_eq!(body[0]["result"]["data"], 1);
        assert_eq!(body[1]["result"]["error"]["data"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let req = RawRequest::new(
            r#"[{"path":"echo","type":"query"},{"path":"echo","type":"query"}]"#,
        );
        let response = server(1).handle_request(req, Context::new()).await;
        assert_eq!(response.status, 413);
    }

    #[tokio::test]
    async fn test_subscription_in_request_rejected() {
        let req = RawRequest::new(r#"{"path":"feed","type":"subscription"}"#);
        let response = server(10).handle_request(req, Context::new()).await;
        assert_eq!(response.status, 405);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_batch_completion_order() {
        let req = RawRequest::new(
            r#"[{"path":"sleep","type":"query","input":30},
                {"path":"sleep","type":"query","input":10},
                {"path":"sleep","type":"query","input":20}]"#,
        )
        .with_metadata(BATCH_MODE_KEY, "stream");
        let response = server(10).handle_request(req, Context::new()).await;
        assert_eq!(response.status, 200);

        let mut decoder = BatchStreamDecoder::new();
        let mut order = Vec::new();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            for (index, _) in decoder.push(&chunk).unwrap() {
                order.push(index);
            }
        }
        assert_eq!(order, vec![1, 2, 0]);

        let all = decoder.finish().unwrap();
        assert_eq!(all[&0]["result"]["data"], 30);
        assert_eq!(all[&1]["result"]["data"], 10);
        assert_eq!(all[&2]["result"]["data"], 20);
    }

    #[tokio::test]
    async fn test_empty_streamed_batch() {
        let req = RawRequest::new("[]").with_metadata(BATCH_MODE_KEY, "stream");
        let response = server(10).handle_request(req, Context::new()).await;
        assert_eq!(&response.collect_body().await[..], b"{}");
    }

    #[test]
    fn test_batch_status() {
        assert_eq!(batch_status([200, 200].into_iter()), 200);
        assert_eq!(batch_status([404, 404].into_iter()), 404);
        assert_eq!(batch_status([200, 404].into_iter()), 207);
        assert_eq!(batch_status(std::iter::empty()), 200);
    }
}
