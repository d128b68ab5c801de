//! Observable stream - minimal cold, push-based stream with explicit teardown.
//!
//! Subscriptions and every link in the client chain are modelled as an
//! [`Observable`]. The primitive (not producers) enforces the delivery
//! contract:
//!
//! - nothing happens until [`Observable::subscribe`] is called, and every call
//!   runs the producer again (cold)
//! - after `error` or `complete` no further events reach the observer
//! - [`Subscription::unsubscribe`] is idempotent, stops delivery and runs the
//!   producer's teardown at most once
//! - a panicking teardown is reported to the unhandled-error sink instead of
//!   unwinding into the caller
//!
//! # Example
//!
//! ```
//! use linkwire::observable::{Observable, Observer, Teardown};
//!
//! let numbers: Observable<u32, String> = Observable::new(|subscriber| {
//!     subscriber.next(1);
//!     subscriber.next(2);
//!     subscriber.complete();
//!     Teardown::noop()
//! });
//!
//! let subscription = numbers.subscribe(Observer::new().on_next(|n: u32| println!("{n}")));
//! assert!(subscription.is_closed());
//! ```

mod convert;
mod operators;
mod sink;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub use convert::ObservableStream;
pub(crate) use operators::relay;
pub(crate) use sink::panic_message;
pub use sink::{report_unhandled, set_unhandled_error_hook, UnhandledErrorHook};

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn<E> = Box<dyn Fn(E) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;
type Producer<T, E> = dyn Fn(Subscriber<T, E>) -> Teardown + Send + Sync;

/// Callbacks receiving the events of one subscription.
///
/// All callbacks are optional. `on_error` and `on_complete` are invoked at
/// most once, and never both.
pub struct Observer<T, E> {
    on_next: Option<NextFn<T>>,
    on_error: Option<ErrorFn<E>>,
    on_complete: Option<CompleteFn>,
}

impl<T, E> Observer<T, E> {
    /// Create an observer that ignores every event.
    pub fn new() -> Self {
        Self {
            on_next: None,
            on_error: None,
            on_complete: None,
        }
    }

    /// Set the value callback.
    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    /// Set the terminal error callback.
    pub fn on_error(mut self, f: impl Fn(E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Set the terminal completion callback.
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl<T, E> Default for Observer<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cleanup registered by a producer, run when the subscription closes.
pub enum Teardown {
    /// Nothing to clean up.
    Noop,
    /// Run a callback once.
    Callback(Box<dyn FnOnce() + Send>),
    /// Unsubscribe from an upstream subscription.
    Subscription(Subscription),
}

impl Teardown {
    /// Teardown that does nothing.
    pub fn noop() -> Self {
        Teardown::Noop
    }

    /// Teardown running `f` exactly once.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Teardown::Callback(Box::new(f))
    }

    fn run(self) {
        match self {
            Teardown::Noop => {}
            Teardown::Callback(f) => f(),
            Teardown::Subscription(subscription) => subscription.unsubscribe(),
        }
    }
}

impl From<Subscription> for Teardown {
    fn from(subscription: Subscription) -> Self {
        Teardown::Subscription(subscription)
    }
}

impl From<()> for Teardown {
    fn from(_: ()) -> Self {
        Teardown::Noop
    }
}

/// Where the teardown of a subscription currently stands.
enum TeardownSlot {
    /// Producer has not returned yet.
    Pending,
    /// Producer returned; teardown waiting for close.
    Registered(Teardown),
    /// Close requested while the producer was still running.
    CloseRequested,
    /// Teardown already ran (or was never needed).
    Closed,
}

struct Shared<T, E> {
    observer: Observer<T, E>,
    done: AtomicBool,
    slot: Mutex<TeardownSlot>,
}

impl<T, E> Shared<T, E> {
    fn close(&self) {
        self.done.store(true, Ordering::Release);

        let teardown = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, TeardownSlot::Closed) {
                TeardownSlot::Pending => {
                    *slot = TeardownSlot::CloseRequested;
                    None
                }
                TeardownSlot::Registered(teardown) => Some(teardown),
                TeardownSlot::CloseRequested => {
                    *slot = TeardownSlot::CloseRequested;
                    None
                }
                TeardownSlot::Closed => None,
            }
        };

        if let Some(teardown) = teardown {
            run_teardown(teardown);
        }
    }

    fn register(&self, teardown: Teardown) {
        let run_now = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, TeardownSlot::Closed) {
                TeardownSlot::Pending => {
                    *slot = TeardownSlot::Registered(teardown);
                    None
                }
                _ => Some(teardown),
            }
        };

        if let Some(teardown) = run_now {
            run_teardown(teardown);
        }
    }
}

fn run_teardown(teardown: Teardown) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| teardown.run())) {
        report_unhandled(&sink::panic_message(payload.as_ref()));
    }
}

trait Close: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: 'static, E: 'static> Close for Shared<T, E> {
    fn close(&self) {
        Shared::close(self)
    }

    fn is_closed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Producer-side handle used to push events to one observer.
///
/// Cheap to clone; clones share the same delivery state.
pub struct Subscriber<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Subscriber<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static, E: 'static> Subscriber<T, E> {
    /// Push a value. Ignored once the subscription is closed.
    pub fn next(&self, value: T) {
        if self.shared.done.load(Ordering::Acquire) {
            return;
        }
        if let Some(on_next) = &self.shared.observer.on_next {
            on_next(value);
        }
    }

    /// Terminate with an error. Only the first terminal signal is delivered.
    pub fn error(&self, error: E) {
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(on_error) = &self.shared.observer.on_error {
            on_error(error);
        }
        self.shared.close();
    }

    /// Terminate successfully. Only the first terminal signal is delivered.
    pub fn complete(&self) {
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(on_complete) = &self.shared.observer.on_complete {
            on_complete();
        }
        self.shared.close();
    }

    /// Whether the observer stopped listening (terminal event or unsubscribe).
    pub fn is_closed(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }
}

/// Handle returned by [`Observable::subscribe`].
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn Close>,
}

impl Subscription {
    /// Stop delivery and run the producer's teardown.
    ///
    /// Idempotent: calls after the first are no-ops.
    pub fn unsubscribe(&self) {
        self.inner.close();
    }

    /// Whether no further events will be delivered.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Wrap into a guard that unsubscribes when dropped.
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard {
            subscription: self,
            armed: true,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Unsubscribes on drop.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriptionGuard {
    subscription: Subscription,
    armed: bool,
}

impl SubscriptionGuard {
    /// Release the subscription without unsubscribing.
    pub fn disarm(mut self) -> Subscription {
        self.armed = false;
        self.subscription.clone()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.subscription.unsubscribe();
        }
    }
}

/// Cold push-based stream of `T` values terminated by `E` or completion.
pub struct Observable<T, E> {
    producer: Arc<Producer<T, E>>,
}

impl<T, E> Clone for Observable<T, E> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Observable")
    }
}

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    /// Create an observable from a producer.
    ///
    /// The producer runs once per subscription and returns the teardown to
    /// run when that subscription closes.
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Subscriber<T, E>) -> Teardown + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// Start a new independent execution delivering to `observer`.
    pub fn subscribe(&self, observer: Observer<T, E>) -> Subscription {
        let shared = Arc::new(Shared {
            observer,
            done: AtomicBool::new(false),
            slot: Mutex::new(TeardownSlot::Pending),
        });

        let teardown = (self.producer)(Subscriber {
            shared: shared.clone(),
        });
        shared.register(teardown);

        Subscription { inner: shared }
    }

    /// Emit one value then complete.
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |subscriber| {
            subscriber.next(value.clone());
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Terminate immediately with `error`.
    pub fn failed(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::new(move |subscriber| {
            subscriber.error(error.clone());
            Teardown::noop()
        })
    }

    /// Complete immediately without values.
    pub fn empty() -> Self {
        Self::new(|subscriber| {
            subscriber.complete();
            Teardown::noop()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Observer<u32, String>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let observer = Observer::new()
            .on_next(move |v: u32| a.lock().push(format!("next:{v}")))
            .on_error(move |e: String| b.lock().push(format!("error:{e}")))
            .on_complete(move || c.lock().push("complete".to_string()));
        (log, observer)
    }

    #[test]
    fn test_cold_subscribe_runs_producer_per_subscription() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let obs: Observable<u32, String> = Observable::new(move |s| {
            counter.fetch_add(1, Ordering::SeqCst);
            s.complete();
            Teardown::noop()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        obs.subscribe(Observer::new());
        obs.subscribe(Observer::new());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_events_after_complete() {
        let obs: Observable<u32, String> = Observable::new(|s| {
            s.next(1);
            s.complete();
            s.next(2);
            s.error("late".into());
            s.complete();
            Teardown::noop()
        });
        let (log, observer) = recorder();
        obs.subscribe(observer);

        assert_eq!(*log.lock(), vec!["next:1", "complete"]);
    }

    #[test]
    fn test_no_events_after_error() {
        let obs: Observable<u32, String> = Observable::new(|s| {
            s.error("boom".into());
            s.next(1);
            s.complete();
            Teardown::noop()
        });
        let (log, observer) = recorder();
        obs.subscribe(observer);

        assert_eq!(*log.lock(), vec!["error:boom"]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_tears_down_once() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();
        let slot: Arc<Mutex<Option<Subscriber<u32, String>>>> = Arc::new(Mutex::new(None));
        let captured = slot.clone();

        let obs: Observable<u32, String> = Observable::new(move |s| {
            *captured.lock() = Some(s);
            let counter = counter.clone();
            Teardown::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let (log, observer) = recorder();
        let subscription = obs.subscribe(observer);
        subscription.unsubscribe();
        subscription.unsubscribe();

        let subscriber = slot.lock().take().unwrap();
        subscriber.next(7);
        subscriber.complete();

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(log.lock().is_empty());
        assert!(subscription.is_closed());
    }

    #[test]
    fn test_complete_during_subscribe_runs_teardown() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();
        let obs: Observable<u32, String> = Observable::new(move |s| {
            s.complete();
            let counter = counter.clone();
            Teardown::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let subscription = obs.subscribe(Observer::new());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_then_complete_race_tears_down_once() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();
        let slot: Arc<Mutex<Option<Subscriber<u32, String>>>> = Arc::new(Mutex::new(None));
        let captured = slot.clone();

        let obs: Observable<u32, String> = Observable::new(move |s| {
            *captured.lock() = Some(s);
            let counter = counter.clone();
            Teardown::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let (log, observer) = recorder();
        let subscription = obs.subscribe(observer);
        let subscriber = slot.lock().take().unwrap();

        let a = std::thread::spawn({
            let subscription = subscription.clone();
            move || subscription.unsubscribe()
        });
        let b = std::thread::spawn(move || subscriber.complete());
        a.join().unwrap();
        b.join().unwrap();

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(log.lock().len() <= 1);
    }

    #[test]
    fn test_panicking_teardown_is_not_reraised() {
        let obs: Observable<u32, String> =
            Observable::new(|_s| Teardown::new(|| panic!("teardown exploded")));

        let subscription = obs.subscribe(Observer::new());
        subscription.unsubscribe();
        assert!(subscription.is_closed());
    }

    #[test]
    fn test_teardown_unsubscribes_upstream() {
        let upstream_closed = Arc::new(AtomicBool::new(false));
        let flag = upstream_closed.clone();
        let upstream: Observable<u32, String> = Observable::new(move |_s| {
            let flag = flag.clone();
            Teardown::new(move || flag.store(true, Ordering::SeqCst))
        });

        let downstream: Observable<u32, String> = Observable::new(move |s| {
            let forward = s.clone();
            upstream
                .subscribe(Observer::new().on_next(move |v| forward.next(v)))
                .into()
        });

        let subscription = downstream.subscribe(Observer::new());
        assert!(!upstream_closed.load(Ordering::SeqCst));
        subscription.unsubscribe();
        assert!(upstream_closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_guard_unsubscribes_on_drop() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();
        let obs: Observable<u32, String> = Observable::new(move |_s| {
            let counter = counter.clone();
            Teardown::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        {
            let _guard = obs.subscribe(Observer::new()).into_guard();
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        let subscription = obs.subscribe(Observer::new()).into_guard().disarm();
        assert!(!subscription.is_closed());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_of_failed_empty() {
        let (log, observer) = recorder();
        Observable::of(5).subscribe(observer);
        assert_eq!(*log.lock(), vec!["next:5", "complete"]);

        let (log, observer) = recorder();
        Observable::failed("nope".to_string()).subscribe(observer);
        assert_eq!(*log.lock(), vec!["error:nope"]);

        let (log, observer) = recorder();
        Observable::empty().subscribe(observer);
        assert_eq!(*log.lock(), vec!["complete"]);
    }
}
