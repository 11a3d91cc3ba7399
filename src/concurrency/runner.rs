//! Task runner with a bounded worker width and first-error cancellation

use crate::concurrency::pool::PassportsPool;
use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Runner {
    pool: PassportsPool,
    cancel: CancellationToken,
    first_error: Arc<Mutex<Option<ReplicationError>>>,
    tasks: JoinSet<()>,
}

impl Runner {
    /// A runner with its own cancellation scope.
    pub fn new(width: usize) -> Self {
        Self::with_parent(width, &CancellationToken::new())
    }

    /// A runner canceled together with `parent`; canceling the runner does
    /// not cancel the parent.
    pub fn with_parent(width: usize, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        Self {
            pool: PassportsPool::new(width, cancel.clone()),
            cancel,
            first_error: Arc::new(Mutex::new(None)),
            tasks: JoinSet::new(),
        }
    }

    /// Token every task receives; tasks should check it between steps.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pool(&self) -> &PassportsPool {
        &self.pool
    }

    fn record(slot: &Mutex<Option<ReplicationError>>, err: ReplicationError) {
        let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Spawn `task` once a passport is available. A task that fails records
    /// its error (if it is the first) and cancels the rest.
    pub fn add_task<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let pool = self.pool.clone();
        let cancel = self.cancel.clone();
        let first_error = self.first_error.clone();

        self.tasks.spawn(async move {
            let passport = match pool.apply().await {
                Ok(passport) => passport,
                Err(err) => {
                    tracing::debug!(error = %err, "task skipped, no passport");
                    return;
                }
            };

            let result = task(cancel.clone()).await;
            if let Err(err) = pool.revoke(passport) {
                tracing::warn!(error = %err, "passport returned to a stopped pool");
            }

            if let Err(err) = result {
                Self::record(&first_error, err);
                cancel.cancel();
            }
        });
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until every task has finished; returns the first error seen.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(join_err) = joined {
                Self::record(&self.first_error, ReplicationError::Task(join_err.to_string()));
                self.cancel.cancel();
            }
        }

        let first = self
            .first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{Instant, sleep};

    #[tokio::test(start_paused = true)]
    async fn width_bounds_concurrency() {
        let mut runner = Runner::new(3);
        let pool = runner.pool().clone();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        for _ in 0..15 {
            let active = active.clone();
            let peak = peak.clone();
            runner.add_task(move |_cancel| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        runner.wait().await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(600), "{:?}", elapsed);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_error_cancels_the_rest() {
        let mut runner = Runner::new(2);
        let pool = runner.pool().clone();
        let completed = Arc::new(AtomicUsize::new(0));

        runner.add_task(|_cancel| async {
            sleep(Duration::from_millis(10)).await;
            Err(ReplicationError::http(500, "boom"))
        });
        for _ in 0..5 {
            let completed = completed.clone();
            runner.add_task(move |cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ReplicationError::Canceled),
                    _ = sleep(Duration::from_secs(10)) => {
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            });
        }

        let err = runner.wait().await.unwrap_err();
        assert_eq!(err.status_code(), Some(500));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_tasks() {
        let parent = CancellationToken::new();
        let mut runner = Runner::with_parent(1, &parent);
        let token = runner.cancellation();
        parent.cancel();

        runner.add_task(|_cancel| async { Ok(()) });
        runner.wait().await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let mut runner = Runner::new(1);
        let pool = runner.pool().clone();
        runner.add_task(|_cancel| async {
            if true {
                panic!("worker crashed");
            }
            Ok(())
        });
        let err = runner.wait().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Task(_)));
        // The panicking task's passport is released while unwinding.
        assert_eq!(pool.in_flight(), 0);
    }
}
