use std::sync::Arc;

use crate::client::link::{Link, LinkChain, LinkNext, OperationStream};
use crate::envelope::{Operation, ProcedureKind};

type Condition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Routes each operation into one of two sub-chains.
///
/// Both sub-chains must end in a terminal link; the rest of the outer chain
/// is not used.
#[derive(Clone)]
pub struct SplitLink {
    condition: Condition,
    when_true: LinkChain,
    when_false: LinkChain,
}

impl SplitLink {
    pub fn new<F>(condition: F, when_true: Vec<Arc<dyn Link>>, when_false: Vec<Arc<dyn Link>>) -> Self
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        Self {
            condition: Arc::new(condition),
            when_true: LinkChain::new(when_true),
            when_false: LinkChain::new(when_false),
        }
    }

    /// Subscriptions go to `streaming`, queries and mutations to `other`.
    pub fn subscriptions(streaming: Vec<Arc<dyn Link>>, other: Vec<Arc<dyn Link>>) -> Self {
        Self::new(
            |op| op.kind == ProcedureKind::Subscription,
            streaming,
            other,
        )
    }
}

impl Link for SplitLink {
    fn call(&self, op: Operation, _next: LinkNext) -> OperationStream {
        if (self.condition)(&op) {
            self.when_true.execute(op)
        } else {
            self.when_false.execute(op)
        }
    }
}

impl std::fmt::Debug for SplitLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitLink")
            .field("when_true", &self.when_true)
            .field("when_false", &self.when_false)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::link::link_fn;
    use crate::envelope::OperationResponse;
    use crate::observable::{Observable, Observer};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    fn answer(tag: &'static str) -> Arc<dyn Link> {
        link_fn(move |_op: Operation, _next| Observable::of(OperationResponse::single(json!(tag))))
    }

    #[test]
    fn test_routes_by_kind() {
        let split = SplitLink::subscriptions(vec![answer("stream")], vec![answer("batch")]);
        let chain = LinkChain::new(vec![Arc::new(split) as Arc<dyn Link>]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [ProcedureKind::Query, ProcedureKind::Subscription, ProcedureKind::Mutation] {
            let out = seen.clone();
            chain
                .execute(Operation::new(1, kind, "x", Value::Null))
                .subscribe(Observer::new().on_next(move |r: OperationResponse| {
                    out.lock().push(r.data.as_str().unwrap_or_default().to_string())
                }));
        }
        assert_eq!(*seen.lock(), vec!["batch", "stream", "batch"]);
    }
}
