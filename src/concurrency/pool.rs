//! Passport pool: a cancellable counting semaphore

use crate::concurrency::{ConcurrencyError, ConcurrencyResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A right to run; returned to the pool when dropped.
#[derive(Debug)]
pub struct Passport {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Passport {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct PassportsPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl PassportsPool {
    /// A pool of `capacity` passports (at least one) tied to `cancel`.
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel,
        }
    }

    /// Wait for a passport. Fails as soon as the pool is canceled, even if a
    /// passport would be available.
    pub async fn apply(&self) -> ConcurrencyResult<Passport> {
        if self.cancel.is_cancelled() {
            return Err(ConcurrencyError::Canceled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConcurrencyError::Canceled),
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit.map_err(|_| ConcurrencyError::Closed)?;
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(Passport {
                    _permit: permit,
                    in_flight: self.in_flight.clone(),
                })
            }
        }
    }

    /// Give a passport back. Reports cancellation so callers can stop early.
    pub fn revoke(&self, passport: Passport) -> ConcurrencyResult<()> {
        drop(passport);
        if self.cancel.is_cancelled() {
            Err(ConcurrencyError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn caps_outstanding_passports() {
        let pool = PassportsPool::new(2, CancellationToken::new());
        let a = pool.apply().await.unwrap();
        let _b = pool.apply().await.unwrap();
        assert_eq!(pool.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.apply()).await;
        assert!(blocked.is_err());

        pool.revoke(a).unwrap();
        assert_eq!(pool.in_flight(), 1);
        let _c = pool.apply().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unblocks_waiters() {
        let pool = PassportsPool::new(1, CancellationToken::new());
        let held = pool.apply().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.apply().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ConcurrencyError::Canceled)));
        assert!(matches!(pool.revoke(held), Err(ConcurrencyError::Canceled)));
        assert!(matches!(pool.apply().await, Err(ConcurrencyError::Canceled)));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let pool = PassportsPool::new(0, CancellationToken::new());
        assert_eq!(pool.capacity(), 1);
    }
}
