use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::client::link::{Link, LinkNext, OperationStream};
use crate::envelope::{Operation, OperationResponse};
use crate::observable::{Observable, Observer, Subscriber, Subscription, Teardown};
use crate::rpc_error::ClientError;

/// A failed attempt, as seen by the retry policy.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    pub op: &'a Operation,
    pub error: &'a ClientError,
    /// Attempts made so far, starting at 1.
    pub attempts: u32,
}

type Policy = Arc<dyn Fn(&RetryAttempt<'_>) -> bool + Send + Sync>;
type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Resubscribes to the rest of the chain when an attempt fails and the
/// policy allows it.
///
/// Values from every attempt are forwarded. Only the last attempt's error
/// or completion reaches the caller. Cancelled operations are never retried.
#[derive(Clone)]
pub struct RetryLink {
    policy: Policy,
    backoff: Backoff,
}

impl RetryLink {
    pub fn new<F>(policy: F) -> Self
    where
        F: Fn(&RetryAttempt<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            policy: Arc::new(policy),
            backoff: Arc::new(|_| Duration::ZERO),
        }
    }

    /// Retry up to `max` times on transport failures.
    pub fn transport_failures(max: u32) -> Self {
        Self::new(move |attempt| attempt.error.is_transport_failure() && attempt.attempts <= max)
    }

    /// Wait `backoff(attempts)` before the next attempt.
    pub fn backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }
}

#[derive(Default)]
struct Slot {
    stopped: bool,
    current: Option<Subscription>,
}

#[derive(Clone)]
struct Attempt {
    op: Operation,
    next: LinkNext,
    subscriber: Subscriber<OperationResponse, ClientError>,
    slot: Arc<Mutex<Slot>>,
    policy: Policy,
    backoff: Backoff,
}

impl Attempt {
    fn start(self, attempts: u32) {
        if self.slot.lock().stopped {
            return;
        }

        let upstream = self.next.run(self.op.clone());
        let (on_value, on_done) = (self.subscriber.clone(), self.subscriber.clone());
        let retry = self.clone();
        let subscription = upstream.subscribe(
            Observer::new()
                .on_next(move |response| on_value.next(response))
                .on_error(move |error| retry.clone().failed(error, attempts))
                .on_complete(move || on_done.complete()),
        );

        let mut slot = self.slot.lock();
        if slot.stopped {
            drop(slot);
            subscription.unsubscribe();
        } else if !subscription.is_closed() {
            slot.current = Some(subscription);
        }
    }

    fn failed(self, error: ClientError, attempts: u32) {
        let again = !self.op.signal.is_cancelled()
            && !self.slot.lock().stopped
            && (self.policy)(&RetryAttempt {
                op: &self.op,
                error: &error,
                attempts,
            });
        if !again {
            self.subscriber.error(error);
            return;
        }

        let wait = (self.backoff)(attempts);
        debug!(
            id = self.op.id,
            path = %self.op.path,
            attempts,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "retrying operation"
        );
        tokio::spawn(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            self.start(attempts + 1);
        });
    }
}

impl Link for RetryLink {
    fn call(&self, op: Operation, next: LinkNext) -> OperationStream {
        let (policy, backoff) = (self.policy.clone(), self.backoff.clone());
        Observable::new(move |subscriber| {
            let slot = Arc::new(Mutex::new(Slot::default()));
            Attempt {
                op: op.clone(),
                next: next.clone(),
                subscriber,
                slot: slot.clone(),
                policy: policy.clone(),
                backoff: backoff.clone(),
            }
            .start(1);

            Teardown::new(move || {
                let current = {
                    let mut slot = slot.lock();
                    slot.stopped = true;
                    slot.current.take()
                };
                if let Some(subscription) = current {
                    subscription.unsubscribe();
                }
            })
        })
    }
}

impl std::fmt::Debug for RetryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::link::{link_fn, Link, LinkChain};
    use crate::envelope::ProcedureKind;
    use crate::rpc_error::ErrorKind;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a transport error until the `n`th attempt.
    fn flaky(succeed_on: u32, attempts: Arc<AtomicU32>) -> Arc<dyn Link> {
        link_fn(move |_op: Operation, _next| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= succeed_on {
                Observable::of(OperationResponse::single(json!(attempt)))
            } else {
                Observable::failed(ClientError::transport("connection reset"))
            }
        })
    }

    fn outcome(chain: &LinkChain) -> Arc<Mutex<Vec<String>>> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (out.clone(), out.clone(), out.clone());
        chain
            .execute(Operation::new(1, ProcedureKind::Query, "x", Value::Null))
            .subscribe(
                Observer::new()
                    .on_next(move |r: OperationResponse| a.lock().push(r.data.to_string()))
                    .on_error(move |e: ClientError| b.lock().push(format!("error:{}", e.kind())))
                    .on_complete(move || c.lock().push("complete".into())),
            );
        out
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let chain = LinkChain::new(vec![
            Arc::new(RetryLink::transport_failures(5)) as Arc<dyn Link>,
            flaky(3, attempts.clone()),
        ]);

        let out = outcome(&chain);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*out.lock(), vec!["3", "complete"]);
    }

    #[tokio::test]
    async fn test_gives_up_with_single_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let chain = LinkChain::new(vec![
            Arc::new(RetryLink::transport_failures(2)) as Arc<dyn Link>,
            flaky(10, attempts.clone()),
        ]);

        let out = outcome(&chain);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*out.lock(), vec!["error:TRANSPORT_FAILURE"]);
    }

    #[tokio::test]
    async fn test_policy_rejects_server_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let chain = LinkChain::new(vec![
            Arc::new(RetryLink::transport_failures(5)) as Arc<dyn Link>,
            link_fn(move |_op: Operation, _next| {
                counter.fetch_add(1, Ordering::SeqCst);
                Observable::failed(ClientError::client(ErrorKind::Forbidden, "no"))
            }),
        ]);

        let out = outcome(&chain);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*out.lock(), vec!["error:FORBIDDEN"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_pending_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let chain = LinkChain::new(vec![
            Arc::new(RetryLink::transport_failures(5).backoff(|_| Duration::from_millis(100)))
                as Arc<dyn Link>,
            flaky(10, attempts.clone()),
        ]);

        let subscription = chain
            .execute(Operation::new(1, ProcedureKind::Query, "x", Value::Null))
            .subscribe(Observer::new());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
