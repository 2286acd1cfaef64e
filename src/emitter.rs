//! Named listener registry with synchronous fan-out.
//!
//! Listeners are invoked in registration order on the thread that calls
//! [`EventEmitter::emit`]. The registry lock is released before any listener
//! runs, so a listener may subscribe, unsubscribe or emit again.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifies one registration, returned by [`EventEmitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Registration<A: ?Sized> {
    id: ListenerId,
    once: bool,
    callback: Callback<A>,
}

impl<A: ?Sized> Clone for Registration<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            callback: self.callback.clone(),
        }
    }
}

/// Event name → ordered listeners, generic over the argument type.
pub struct EventEmitter<A: ?Sized> {
    listeners: Mutex<HashMap<String, Vec<Registration<A>>>>,
    next_id: AtomicU64,
}

impl<A: ?Sized + 'static> EventEmitter<A> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for every future `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.register(event, false, Arc::new(listener))
    }

    /// Register a listener removed right before its first invocation.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.register(event, true, Arc::new(listener))
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|registration| registration.id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Remove every listener of `event`, or of all events when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut listeners = self.lock();
        match event {
            Some(event) => {
                listeners.remove(event);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Names of events that currently have listeners
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke every listener of `event` with `args`.
    ///
    /// Returns true if the event had listeners. A panicking listener is
    /// logged and the remaining listeners still run.
    pub fn emit(&self, event: &str, args: &A) -> bool {
        let snapshot = {
            let mut listeners = self.lock();
            let Some(registered) = listeners.get_mut(event) else {
                return false;
            };
            let snapshot = registered.clone();
            registered.retain(|registration| !registration.once);
            if registered.is_empty() {
                listeners.remove(event);
            }
            snapshot
        };

        log::trace!("Dispatching '{}' to {} listeners", event, snapshot.len());
        for registration in &snapshot {
            let callback = &registration.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                log::error!(
                    "Listener {:?} for '{}' panicked; continuing with remaining listeners",
                    registration.id,
                    event
                );
            }
        }
        true
    }

    fn register(&self, event: &str, once: bool, callback: Callback<A>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, callback });
        id
    }

    // Listeners never run under the lock, so a poisoned lock still holds a
    // consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Registration<A>>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<A: ?Sized + 'static> Default for EventEmitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized> std::fmt::Debug for EventEmitter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}
