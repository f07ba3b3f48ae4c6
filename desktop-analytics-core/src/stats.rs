//! Delivery statistics
//!
//! The batching transport only reports failures per connection, never per
//! event, so a failure notice charges every outstanding event as failed.

use std::sync::{Mutex, PoisonError};

/// Immutable snapshot of delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatistics {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl DeliveryStatistics {
    pub fn new(submitted: u64, succeeded: u64, failed: u64) -> Self {
        Self {
            submitted,
            succeeded,
            failed,
        }
    }

    /// Submitted events not yet resolved as succeeded or failed
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }
}

/// Concurrency-safe delivery counters
///
/// All three counters live behind one lock so that `outstanding` can never be
/// observed (or charged) half-updated.
#[derive(Debug, Default)]
pub struct StatisticsMonitor {
    counters: Mutex<DeliveryStatistics>,
}

impl StatisticsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a tracked event was handed to the backend
    pub fn record_submission(&self) {
        self.update(|stats| stats.submitted += 1);
    }

    /// Note that a tracked event was delivered
    pub fn record_success(&self) {
        self.update(|stats| {
            if stats.outstanding() > 0 {
                stats.succeeded += 1;
            }
        });
    }

    /// Charge every outstanding event as failed
    pub fn record_bulk_failure(&self) {
        self.update(|stats| stats.failed += stats.outstanding());
    }

    pub fn snapshot(&self) -> DeliveryStatistics {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut DeliveryStatistics)) {
        let mut stats = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}
