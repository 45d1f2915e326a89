//! Process-wide context registry
//!
//! OpenSSL's verification callback is a global C-style hook: when it
//! fires mid-handshake it carries the native context, not the owning
//! [`SessionContext`](crate::SessionContext). This registry is the route
//! back. Every live context registers its handle at construction and
//! deregisters it synchronously when `close()` begins, before the native
//! resource can be released, so a lookup never dispatches to a context
//! whose destruction has started.
//!
//! The map mutex is scoped to the map operations themselves and is never
//! held while a verification callback runs, so handshakes on unrelated
//! connections do not serialize each other.

use crate::context::{ContextInner, SessionContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

static REGISTRY: OnceLock<Mutex<HashMap<usize, Weak<ContextInner>>>> = OnceLock::new();

fn map() -> &'static Mutex<HashMap<usize, Weak<ContextInner>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a context under its handle.
///
/// A duplicate handle is a resource-reuse bug in this crate, not a
/// recoverable runtime condition.
pub(crate) fn register(handle: usize, context: &Arc<ContextInner>) {
    let mut m = map().lock().unwrap_or_else(|e| e.into_inner());
    let prev = m.insert(handle, Arc::downgrade(context));
    assert!(prev.is_none(), "context handle {} registered twice", handle);
    log::trace!("registered session context handle {}", handle);
}

/// Look up the owning context for a native handle.
///
/// Returns `None` for unknown handles and for contexts whose `close()`
/// has begun. Safe to call re-entrantly from verification callbacks of
/// concurrent handshakes.
pub fn lookup(handle: usize) -> Option<SessionContext> {
    let weak = {
        let m = map().lock().unwrap_or_else(|e| e.into_inner());
        m.get(&handle).cloned()
    }?;
    let inner = weak.upgrade()?;
    if inner.is_closed() {
        return None;
    }
    Some(SessionContext::from_inner(inner))
}

/// Remove a handle. Idempotent: removing an absent handle is a no-op,
/// which tolerates a close() racing the final reference drop.
pub(crate) fn deregister(handle: usize) {
    let mut m = map().lock().unwrap_or_else(|e| e.into_inner());
    if m.remove(&handle).is_some() {
        log::trace!("deregistered session context handle {}", handle);
    }
}
