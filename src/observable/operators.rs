//! Stream operators. Each returns a new cold observable that subscribes to
//! its source once per downstream subscription.

use std::sync::Arc;

use super::{Observable, Observer, Subscriber, Teardown};

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    /// Transform every value.
    pub fn map<U, F>(self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |subscriber: Subscriber<U, E>| {
            let f = f.clone();
            let observer = relay(subscriber, move |value| Ok(f(value)), |error| error);
            self.subscribe(observer).into()
        })
    }

    /// Transform the terminal error.
    pub fn map_err<E2, F>(self, f: F) -> Observable<T, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |subscriber: Subscriber<T, E2>| {
            let f = f.clone();
            let observer = relay(subscriber, Ok, move |error| f(error));
            self.subscribe(observer).into()
        })
    }

    /// Transform every value, terminating with the error if `f` fails.
    pub fn try_map<U, F>(self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |subscriber: Subscriber<U, E>| {
            let f = f.clone();
            let observer = relay(subscriber, move |value| f(value), |error| error);
            self.subscribe(observer).into()
        })
    }

    /// Observe values without changing them.
    pub fn inspect<F>(self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.try_map(move |value| {
            f(&value);
            Ok(value)
        })
    }

    /// Observe the terminal error without changing it.
    pub fn inspect_err<F>(self, f: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.map_err(move |error| {
            f(&error);
            error
        })
    }

    /// Run `f` once when a subscription closes for any reason.
    pub fn finalize<F>(self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |subscriber: Subscriber<T, E>| {
            let upstream = self.subscribe(relay(subscriber, Ok, |error| error));
            let f = f.clone();
            Teardown::new(move || {
                upstream.unsubscribe();
                f();
            })
        })
    }
}

/// Observer forwarding into `subscriber`, mapping values and errors.
///
/// A failing value mapping terminates the downstream with the mapped error.
pub(crate) fn relay<T, U, E, E2, V, R>(
    subscriber: Subscriber<U, E2>,
    on_value: V,
    on_error: R,
) -> Observer<T, E>
where
    T: 'static,
    U: 'static,
    E: 'static,
    E2: 'static,
    V: Fn(T) -> Result<U, E2> + Send + Sync + 'static,
    R: Fn(E) -> E2 + Send + Sync + 'static,
{
    let next = subscriber.clone();
    let error = subscriber.clone();
    let complete = subscriber;
    Observer::new()
        .on_next(move |value| match on_value(value) {
            Ok(mapped) => next.next(mapped),
            Err(e) => next.error(e),
        })
        .on_error(move |e| error.error(on_error(e)))
        .on_complete(move || complete.complete())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn numbers() -> Observable<u32, String> {
        Observable::new(|s| {
            s.next(1);
            s.next(2);
            s.next(3);
            s.complete();
            Teardown::noop()
        })
    }

    fn collect(obs: Observable<u32, String>) -> Vec<String> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        obs.subscribe(
            Observer::new()
                .on_next(move |v: u32| a.lock().push(v.to_string()))
                .on_error(move |e: String| b.lock().push(format!("error:{e}")))
                .on_complete(move || c.lock().push("done".into())),
        );
        let out = log.lock().clone();
        out
    }

    #[test]
    fn test_map() {
        assert_eq!(collect(numbers().map(|n| n * 10)), vec!["10", "20", "30", "done"]);
    }

    #[test]
    fn test_try_map_error_stops_stream() {
        let obs = numbers().try_map(|n| {
            if n == 2 {
                Err("two".to_string())
            } else {
                Ok(n)
            }
        });
        assert_eq!(collect(obs), vec!["1", "error:two"]);
    }

    #[test]
    fn test_map_err() {
        let obs: Observable<u32, String> = Observable::failed(7u8).map_err(|code| format!("code {code}"));
        assert_eq!(collect(obs), vec!["error:code 7"]);
    }

    #[test]
    fn test_inspect_sees_values() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let out = collect(numbers().inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_finalize_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let obs = numbers().finalize(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let subscription = obs.subscribe(Observer::new());
        subscription.unsubscribe();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
