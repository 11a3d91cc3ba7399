//! Bounded concurrency for replication jobs
//!
//! A [`PassportsPool`] hands out a fixed number of passports; holding one is
//! the right to run. A [`Runner`] spawns tasks that each wait for a passport,
//! records the first task error and cancels everything else when one fails.
//!
//! ```no_run
//! use registry_replicator::concurrency::Runner;
//!
//! # async fn example() -> registry_replicator::error::Result<()> {
//! let mut runner = Runner::new(3);
//! for repository in ["library/nginx", "library/redis"] {
//!     runner.add_task(move |cancel| async move {
//!         if cancel.is_cancelled() {
//!             return Ok(());
//!         }
//!         println!("replicating {}", repository);
//!         Ok(())
//!     });
//! }
//! runner.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod runner;

pub use pool::{Passport, PassportsPool};
pub use runner::Runner;

#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("pool canceled")]
    Canceled,

    #[error("pool closed")]
    Closed,
}

pub type ConcurrencyResult<T> = Result<T, ConcurrencyError>;
