use std::{future::Future, sync::Arc};

use tokio::sync::Semaphore;

use crate::{errors::Error, Result};

/// Global bounded-concurrency gate for protocol operations.
///
/// At most `capacity` admitted closures run at once across all users. Waiters
/// are admitted in FIFO order (tokio's semaphore is fair), and a finished slot
/// goes straight to the next waiter. There is no queue bound; callers just wait.
#[derive(Clone, Debug)]
pub struct RequestLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl RequestLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of closures currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::External("request limiter closed".to_string()))?;
        f().await
    }
}
