//! Scan/watch scheduling primitives
//!
//! Time markers rate-limit periodic work; watch items tell the controller
//! which policies to trigger when images are pushed or deleted.

pub mod marker;
pub mod watch;

pub use marker::TimeMarker;
pub use watch::{InMemoryWatchItemDao, WatchItem, WatchItemDao, WatchOperation};

use std::time::Duration;

pub const SCAN_ALL_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
pub const SCAN_OVERVIEW_INTERVAL: Duration = Duration::from_secs(15);
pub const REPLICATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The markers a process shares, created once by the composition root
#[derive(Debug)]
pub struct Markers {
    pub scan_all: TimeMarker,
    pub scan_overview: TimeMarker,
    pub replication_sweep: TimeMarker,
}

impl Markers {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            scan_all: TimeMarker::new(SCAN_ALL_INTERVAL),
            scan_overview: TimeMarker::new(SCAN_OVERVIEW_INTERVAL),
            replication_sweep: TimeMarker::new(sweep_interval),
        }
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new(REPLICATION_SWEEP_INTERVAL)
    }
}
