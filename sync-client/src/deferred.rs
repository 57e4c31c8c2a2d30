//! Resolve-once completion signal.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// A value that is filled in exactly once and can be awaited by any number
/// of clones.
///
/// Later `resolve` calls are ignored, so racing completion paths (last
/// acknowledgement vs. timeout, end-of-stored-events vs. cancel) are safe.
pub struct Deferred<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Deferred<T> {
    /// An unresolved signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fill in the value. Returns false if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// Whether `resolve` has been called.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The value, if resolved.
    pub fn value(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            // `self` keeps the sender alive, so this only returns on change.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("resolved", &self.tx.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let deferred = Deferred::new();
        assert!(!deferred.is_resolved());
        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert_eq!(deferred.value(), Some(1));
        assert_eq!(deferred.wait().await, 1);
    }

    #[tokio::test]
    async fn waiters_wake_on_resolve() {
        let deferred: Deferred<&'static str> = Deferred::new();
        let waiter = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.wait().await })
        };
        tokio::task::yield_now().await;
        deferred.resolve("done");
        assert_eq!(waiter.await.unwrap(), "done");
    }
}
