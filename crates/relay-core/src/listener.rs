//! Callback registries with an unregister capability.
//!
//! Listener failures never reach the emitting code path: every callback runs
//! under `catch_unwind`, and a panic is logged and skipped.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::warn;

/// A shared event callback.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entries<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

/// An ordered list of registered callbacks for events of type `E`.
pub struct Listeners<E> {
    entries: Arc<Mutex<Entries<E>>>,
}

impl<E: 'static> Listeners<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Registers `callback`; the returned handle removes it again.
    pub fn register<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut entries = self.entries.lock();
            let id = entries.next_id;
            entries.next_id += 1;
            entries.callbacks.push((id, Arc::new(callback)));
            id
        };
        let weak: Weak<Mutex<Entries<E>>> = Arc::downgrade(&self.entries);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(entries) = weak.upgrade() {
                    entries.lock().callbacks.retain(|(cid, _)| *cid != id);
                }
            })),
        }
    }

    /// Delivers `event` to every listener in registration order.
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// register or unregister listeners.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .entries
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in &snapshot {
            call_guarded(callback.as_ref(), event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().callbacks.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Unregister capability returned by [`Listeners::register`].
///
/// Dropping the handle leaves the listener registered.
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    /// Removes the listener. Calling this after the registry is gone is a no-op.
    pub fn unregister(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("registered", &self.remove.is_some())
            .finish()
    }
}

/// Invokes one callback, swallowing (and logging) a panic.
pub fn call_guarded<E: ?Sized>(callback: &(dyn Fn(&E) + Send + Sync), event: &E) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!("Listener panicked; notification dropped");
    }
}
