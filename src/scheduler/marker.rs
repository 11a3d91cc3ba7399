//! Do-not-run-before markers for periodic work

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Records the earliest instant a periodic action may run again.
///
/// A fresh marker allows the first run immediately.
#[derive(Debug)]
pub struct TimeMarker {
    interval: Duration,
    next: RwLock<Option<Instant>>,
}

impl TimeMarker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: RwLock::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Push the next allowed run to `now + interval`.
    pub fn mark(&self) {
        let mut next = self.next.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *next = Some(Instant::now() + self.interval);
    }

    /// Whether the action may run now.
    pub fn check(&self) -> bool {
        match *self.next.read().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            Some(next) => Instant::now() > next,
            None => true,
        }
    }

    /// Check and mark in one step; only one of several racing callers wins.
    pub fn try_mark(&self) -> bool {
        let mut next = self.next.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *next {
            Some(at) if now <= at => false,
            _ => {
                *next = Some(now + self.interval);
                true
            }
        }
    }

    pub fn next(&self) -> Option<Instant> {
        *self.next.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_marker_allows_run() {
        let marker = TimeMarker::new(Duration::from_secs(60));
        assert!(marker.check());
        assert!(marker.next().is_none());
    }

    #[test]
    fn mark_blocks_until_interval_passes() {
        let marker = TimeMarker::new(Duration::from_millis(30));
        marker.mark();
        assert!(!marker.check());

        std::thread::sleep(Duration::from_millis(60));
        assert!(marker.check());
    }

    #[test]
    fn try_mark_wins_once() {
        let marker = TimeMarker::new(Duration::from_secs(60));
        assert!(marker.try_mark());
        assert!(!marker.try_mark());
        assert!(marker.next().is_some());
    }
}
