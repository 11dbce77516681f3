// ABOUTME: Per-backend mapping from event type to an ordered list of handlers
// ABOUTME: Dispatch reads a snapshot so a running handler may register further handlers

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Event-type keyed handler lists with insertion order preserved.
///
/// Registration and lookup may happen from any thread. `handlers_for` clones
/// the current list out from under the lock, so the caller invokes handlers
/// without holding it.
pub struct CallbackRegistry<H> {
    handlers: Mutex<HashMap<String, Vec<H>>>,
}

impl<H: Clone> CallbackRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<H>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a handler for the event type
    pub fn register(&self, event_type: impl Into<String>, handler: H) {
        self.lock()
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    /// Snapshot of the handlers for an event type, in registration order
    pub fn handlers_for(&self, event_type: &str) -> Vec<H> {
        self.lock().get(event_type).cloned().unwrap_or_default()
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.lock().get(event_type).map(Vec::len).unwrap_or(0)
    }

    /// Event types with at least one handler, sorted
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.lock().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<H: Clone> Default for CallbackRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
