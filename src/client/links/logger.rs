use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::client::link::{Link, LinkNext, OperationStream};
use crate::envelope::{Operation, OperationResponse};
use crate::observable::{Observable, Observer};
use crate::rpc_error::ClientError;

/// Which way an event is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Operation leaving the client.
    Up,
    /// Result or error coming back.
    Down,
}

type Filter = Arc<dyn Fn(&Operation, Direction) -> bool + Send + Sync>;

/// Logs every operation on the way out and every result on the way back.
///
/// Outgoing operations and results are logged at `debug`, errors at `warn`,
/// all under the `linkwire::link` target with the elapsed time.
#[derive(Clone)]
pub struct LoggerLink {
    enabled: Filter,
}

impl LoggerLink {
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(|_, _| true),
        }
    }

    /// Only log events for which `filter` returns true.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Operation, Direction) -> bool + Send + Sync + 'static,
    {
        self.enabled = Arc::new(filter);
        self
    }
}

impl Default for LoggerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for LoggerLink {
    fn call(&self, op: Operation, next: LinkNext) -> OperationStream {
        let enabled = self.enabled.clone();
        Observable::new(move |subscriber| {
            let started = Instant::now();
            let log_down = enabled(&op, Direction::Down);
            if enabled(&op, Direction::Up) {
                debug!(
                    target: "linkwire::link",
                    id = op.id,
                    kind = %op.kind,
                    path = %op.path,
                    input = %op.input,
                    "up"
                );
            }

            let (id, kind, path) = (op.id, op.kind, op.path.clone());
            let (on_value, on_error, on_done) =
                (subscriber.clone(), subscriber.clone(), subscriber);
            let error_path = path.clone();
            next.run(op.clone())
                .subscribe(
                    Observer::new()
                        .on_next(move |response: OperationResponse| {
                            if log_down {
                                debug!(
                                    target: "linkwire::link",
                                    id,
                                    kind = %kind,
                                    path = %path,
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "down"
                                );
                            }
                            on_value.next(response);
                        })
                        .on_error(move |error: ClientError| {
                            if log_down {
                                warn!(
                                    target: "linkwire::link",
                                    id,
                                    kind = %kind,
                                    path = %error_path,
                                    code = %error.kind(),
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    error = %error,
                                    "down"
                                );
                            }
                            on_error.error(error);
                        })
                        .on_complete(move || on_done.complete()),
                )
                .into()
        })
    }
}

impl std::fmt::Debug for LoggerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::link::{link_fn, LinkChain};
    use crate::envelope::ProcedureKind;
    use crate::rpc_error::{ClientError, ErrorKind};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[test]
    fn test_passes_events_through() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let filter_seen = seen.clone();
        let logger = LoggerLink::new().filter(move |op, direction| {
            filter_seen.lock().push(format!("{}:{direction:?}", op.path));
            true
        });
        let chain = LinkChain::new(vec![
            Arc::new(logger) as Arc<dyn Link>,
            link_fn(|op: Operation, _| match op.path.as_str() {
                "ok" => Observable::of(OperationResponse::single(json!(1))),
                _ => Observable::failed(ClientError::client(ErrorKind::NotFound, "missing")),
            }),
        ]);

        let out = Arc::new(Mutex::new(Vec::new()));
        for path in ["ok", "bad"] {
            let (a, b) = (out.clone(), out.clone());
            chain
                .execute(Operation::new(1, ProcedureKind::Query, path, Value::Null))
                .subscribe(
                    Observer::new()
                        .on_next(move |r: OperationResponse| a.lock().push(r.data.to_string()))
                        .on_error(move |e: ClientError| b.lock().push(e.kind().to_string())),
                );
        }

        assert_eq!(*out.lock(), vec!["1", "NOT_FOUND"]);
        assert_eq!(*seen.lock(), vec!["ok:Down", "ok:Up", "bad:Down", "bad:Up"]);
    }
}
