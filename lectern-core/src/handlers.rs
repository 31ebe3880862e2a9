//! Keyed callback registries with disposer tokens.
//!
//! Every observer set in Lectern (text observers, relay subscribers,
//! connection listeners, permission listeners) is a [`HandlerRegistry`].
//!
//! ```text
//! subscribe(key, f) ──► Subscription ──drop──► entry removed
//!                                    └─────► key removed when last entry goes
//! dispatch(key, v)  ──► copy entries ──► call each active handler
//!                                       (panics caught + logged)
//! ```
//!
//! Dispatch iterates over a copy of the entries, so handlers may subscribe
//! or unsubscribe while a dispatch is running. An entry disposed mid-dispatch
//! is skipped: after [`Subscription::unsubscribe`] returns, the handler is
//! never invoked again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared callback type stored in a registry.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: self.active.clone(),
            handler: self.handler.clone(),
        }
    }
}

struct RegistryInner<K, T> {
    next_id: u64,
    entries: HashMap<K, Vec<Entry<T>>>,
}

impl<K: Eq + Hash, T> RegistryInner<K, T> {
    fn remove(&mut self, key: &K, id: u64) {
        let emptied = match self.entries.get_mut(key) {
            Some(list) => {
                list.retain(|e| e.id != id);
                list.is_empty()
            }
            None => false,
        };
        // Last subscriber gone: free the key's registration.
        if emptied {
            self.entries.remove(key);
        }
    }
}

/// A registry of callbacks grouped by key.
///
/// Cloning is cheap and yields a handle to the same registry.
pub struct HandlerRegistry<K, T> {
    inner: Arc<Mutex<RegistryInner<K, T>>>,
}

impl<K, T> Clone for HandlerRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> Default for HandlerRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> HandlerRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Register `handler` under `key`. Dropping the returned token removes it.
    pub fn subscribe<F>(&self, key: K, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.entry(key.clone()).or_default().push(Entry {
                id,
                active: active.clone(),
                handler: Arc::new(handler),
            });
            id
        };

        let weak: Weak<Mutex<RegistryInner<K, T>>> = Arc::downgrade(&self.inner);
        Subscription::new(active, move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().remove(&key, id);
            }
        })
    }

    /// Invoke every active handler registered under `key`.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn dispatch(&self, key: &K, value: &T) -> usize {
        let snapshot: Vec<Entry<T>> = match self.inner.lock().entries.get(key) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut completed = 0;
        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let handler = entry.handler.clone();
            match catch_unwind(AssertUnwindSafe(|| handler(value))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    log::error!(
                        "Handler for {key:?} panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        completed
    }

    /// Number of live handlers for `key`.
    pub fn count(&self, key: &K) -> usize {
        self.inner.lock().entries.get(key).map_or(0, Vec::len)
    }

    /// Whether `key` currently has a registration at all.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Total handlers across all keys.
    pub fn total(&self) -> usize {
        self.inner.lock().entries.values().map(Vec::len).sum()
    }

    /// Drop every registration. Outstanding tokens become no-ops.
    pub fn clear(&self) {
        let drained: Vec<Entry<T>> = {
            let mut inner = self.inner.lock();
            inner.entries.drain().flat_map(|(_, list)| list).collect()
        };
        for entry in drained {
            entry.active.store(false, Ordering::Release);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Disposer token returned by every `subscribe`/`observe` call.
///
/// The handler stays registered for as long as the token lives.
#[must_use = "dropping a Subscription immediately unsubscribes the handler"]
pub struct Subscription {
    active: Arc<AtomicBool>,
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F>(active: Arc<AtomicBool>, dispose: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            active,
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Explicitly unsubscribe. Equivalent to dropping the token.
    pub fn unsubscribe(mut self) {
        self.dispose_now();
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn dispose_now(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
