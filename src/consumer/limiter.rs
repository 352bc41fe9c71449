//! Per-partition admission control.
//!
//! Each claimed partition gets its own bounded token pool. The claim loop
//! takes a token before dispatching a message and the handler task returns
//! it when it finishes. A full pool blocks the claim loop, which in turn
//! stops draining the broker's delivery channel for that partition.
//!
//! Waiters are served in FIFO order (`tokio::sync::Semaphore` is fair).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A held admission slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct ConcurrencyToken {
    _permit: OwnedSemaphorePermit,
}

/// Bounded token pool for one partition.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    /// A pool with `capacity` tokens. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently held.
    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a token. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<ConcurrencyToken> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| ConcurrencyToken { _permit: permit })
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> Option<ConcurrencyToken> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ConcurrencyToken { _permit: permit })
    }

    /// Wait until every token is back in the pool, up to `timeout`.
    ///
    /// Returns `true` when the pool drained. The pool is closed either way,
    /// so no further tokens are handed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let permits = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(timeout, self.semaphore.acquire_many(permits))
            .await
            .is_ok_and(|permit| permit.is_ok());
        self.semaphore.close();
        drained
    }
}
