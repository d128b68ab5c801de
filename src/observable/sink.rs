//! Process-wide sink for errors that have no caller to return to.
//!
//! A panicking teardown runs inside `unsubscribe()`; the panic is caught and
//! routed here instead of unwinding into whoever unsubscribed.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

/// Callback receiving unhandled error messages.
pub type UnhandledErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

static HOOK: RwLock<Option<UnhandledErrorHook>> = parking_lot::const_rwlock(None);

/// Install (or clear, with `None`) the process-wide hook.
///
/// Returns the previously installed hook.
pub fn set_unhandled_error_hook(hook: Option<UnhandledErrorHook>) -> Option<UnhandledErrorHook> {
    std::mem::replace(&mut *HOOK.write(), hook)
}

/// Report an error nobody can handle.
///
/// Always logged; forwarded to the installed hook if any.
pub fn report_unhandled(message: &str) {
    tracing::error!(target: "linkwire::unhandled", "{}", message);

    let hook = HOOK.read().clone();
    if let Some(hook) = hook {
        hook(message);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
