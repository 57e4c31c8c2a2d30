//! Reactive value cache.
//!
//! A [`Subject`] holds the last value pushed through it and notifies every
//! observer synchronously, in subscription order. Observers are removed by
//! dropping the [`Subscription`] handle returned from `subscribe`.
//!
//! Notification iterates over a snapshot of the observer list taken when
//! `next` is called, and the lock is released before any observer runs, so an
//! observer may call `next`, `subscribe` or drop its own handle re-entrantly.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Shared<T> {
    value: Option<T>,
    retain: bool,
    observers: Vec<(u64, Observer<T>)>,
    next_id: u64,
}

/// A value cache that may be empty until its first `next`.
pub struct Subject<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// An empty subject that remembers the last value.
    pub fn new() -> Self {
        Self::build(None, true)
    }

    /// A subject seeded with a value.
    pub fn with_value(value: T) -> Self {
        Self::build(Some(value), true)
    }

    /// A subject that never remembers values: late subscribers only see
    /// values pushed after they subscribed. Used for event streams.
    pub fn stream() -> Self {
        Self::build(None, false)
    }

    fn build(value: Option<T>, retain: bool) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                value,
                retain,
                observers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// The current value, if any.
    pub fn value(&self) -> Option<T> {
        self.shared.lock().value.clone()
    }

    /// Store `value` and notify every current observer.
    pub fn next(&self, value: T) {
        let snapshot: Vec<Observer<T>> = {
            let mut shared = self.shared.lock();
            if shared.retain {
                shared.value = Some(value.clone());
            }
            shared.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in snapshot {
            observer(&value);
        }
    }

    /// Register an observer. It receives the current value immediately (if
    /// there is one) and every later value until the handle is dropped.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let observer: Observer<T> = Arc::new(observer);
        let (id, current) = {
            let mut shared = self.shared.lock();
            let id = shared.next_id;
            shared.next_id += 1;
            shared.observers.push((id, Arc::clone(&observer)));
            (id, shared.value.clone())
        };
        if let Some(value) = current {
            observer(&value);
        }

        let weak: Weak<Mutex<Shared<T>>> = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().observers.retain(|(oid, _)| *oid != id);
            }
        })
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.shared.lock().observers.len()
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Subject")
            .field("has_value", &shared.value.is_some())
            .field("observers", &shared.observers.len())
            .finish()
    }
}

/// A subject that always holds a value.
pub struct PersistentSubject<T> {
    inner: Subject<T>,
}

impl<T> Clone for PersistentSubject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> PersistentSubject<T> {
    /// Create with an initial value.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Subject::with_value(initial),
        }
    }

    /// The current value.
    pub fn value(&self) -> T {
        // Seeded at construction and never cleared.
        self.inner
            .value()
            .unwrap_or_else(|| unreachable!("persistent subject without a value"))
    }

    /// Store `value` and notify observers.
    pub fn next(&self, value: T) {
        self.inner.next(value);
    }

    /// Register an observer; it is called with the current value right away.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.subscribe(observer)
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observer_count()
    }
}

impl<T> fmt::Debug for PersistentSubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PersistentSubject").field(&self.inner).finish()
    }
}

/// Handle for a registered observer. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an arbitrary teardown action.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
