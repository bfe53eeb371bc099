//! Single-resolution value: created empty, resolved at most once by a later event.

use tokio::sync::watch;

/// A one-shot slot that any number of waiters can await.
///
/// The first [`Deferred::resolve`] wins; later calls are ignored and report
/// `false`. Waiters that are dropped before resolution are simply abandoned.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store `value` unless already resolved. Returns whether this call resolved it.
    pub fn resolve(&self, value: T) -> bool {
        let mut slot = Some(value);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = slot.take();
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for the value. Pending forever if never resolved.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let value = match rx.wait_for(|v| v.is_some()).await {
            Ok(guard) => (*guard).clone(),
            Err(_) => None,
        };
        match value {
            Some(v) => v,
            // The sender lives in `self`, so this is unreachable in practice.
            None => std::future::pending().await,
        }
    }
}

impl<T: Clone + Send + Sync> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
