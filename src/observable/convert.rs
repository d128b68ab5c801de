//! Bridges between observables and `futures` streams/futures.
//!
//! `from_stream` is how generator-style subscriptions are authored: the
//! stream is pulled on a tokio task and every item is pushed into the
//! observable. Unsubscribing cancels the task, which drops the stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Observable, Observer, Subscription, Teardown};

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    /// Adapt a pull-based stream into an observable.
    ///
    /// `factory` is invoked once per subscription. Must be subscribed from
    /// within a tokio runtime.
    pub fn from_stream<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Observable::new(move |subscriber| {
            let token = CancellationToken::new();
            let stopped = token.clone();
            let stream = factory();

            tokio::spawn(async move {
                futures::pin_mut!(stream);
                loop {
                    tokio::select! {
                        biased;
                        _ = stopped.cancelled() => break,
                        item = stream.next() => match item {
                            Some(Ok(value)) => subscriber.next(value),
                            Some(Err(error)) => {
                                subscriber.error(error);
                                break;
                            }
                            None => {
                                subscriber.complete();
                                break;
                            }
                        },
                    }
                    if subscriber.is_closed() {
                        break;
                    }
                }
            });

            Teardown::new(move || token.cancel())
        })
    }

    /// Convert into a `Stream` of results. Dropping the stream unsubscribes.
    pub fn into_stream(self) -> ObservableStream<T, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let (on_value, on_error, on_done) = (tx.clone(), tx.clone(), tx);

        let subscription = self.subscribe(
            Observer::new()
                .on_next(move |value| {
                    if let Some(tx) = on_value.lock().as_ref() {
                        let _ = tx.send(Ok(value));
                    }
                })
                .on_error(move |error| {
                    if let Some(tx) = on_error.lock().take() {
                        let _ = tx.send(Err(error));
                    }
                })
                .on_complete(move || {
                    on_done.lock().take();
                }),
        );

        ObservableStream { rx, subscription }
    }

    /// Resolve with the first value (or the terminal error), then unsubscribe.
    ///
    /// Returns `None` if the observable completes without emitting. Dropping
    /// the future unsubscribes.
    pub async fn first_value(self) -> Option<Result<T, E>> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let (on_value, on_error, on_done) = (tx.clone(), tx.clone(), tx);

        let _guard = self
            .subscribe(
                Observer::new()
                    .on_next(move |value| {
                        if let Some(tx) = on_value.lock().take() {
                            let _ = tx.send(Ok(value));
                        }
                    })
                    .on_error(move |error| {
                        if let Some(tx) = on_error.lock().take() {
                            let _ = tx.send(Err(error));
                        }
                    })
                    .on_complete(move || {
                        on_done.lock().take();
                    }),
            )
            .into_guard();

        rx.await.ok()
    }
}

/// `Stream` view of an observable subscription.
pub struct ObservableStream<T, E> {
    rx: mpsc::UnboundedReceiver<Result<T, E>>,
    subscription: Subscription,
}

impl<T, E> ObservableStream<T, E> {
    /// Unsubscribe early; buffered items are still yielded.
    pub fn close(&self) {
        self.subscription.unsubscribe();
    }
}

impl<T, E> Stream for ObservableStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T, E> Drop for ObservableStream<T, E> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
