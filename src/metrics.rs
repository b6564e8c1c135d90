//! Run-level counters for scheduling behavior: how much speculative work was
//! done, how much of it was wasted, and how failures were absorbed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected over one run. Cheap to update; readable live from any
/// thread via [`RunMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct RunMetrics {
    /// Notifications handed to stage intake queues (one per stage reached).
    pub notifications_offered: AtomicU64,
    /// Notifications that dominated the stored input and were accepted.
    pub notifications_accepted: AtomicU64,
    /// Notifications discarded at intake as stale.
    pub stale_discarded: AtomicU64,
    /// Batches executed.
    pub batches_run: AtomicU64,
    /// Batches dropped because the transform failed or timed out.
    pub batches_failed: AtomicU64,
    /// Notifications emitted downstream.
    pub emissions: AtomicU64,
    /// Emissions suppressed because the value was unchanged.
    pub unchanged_suppressed: AtomicU64,
    /// Speculative outputs discarded because a dominating output already
    /// existed.
    pub outputs_discarded: AtomicU64,
    /// Corrective notifications emitted while unwinding failed batches.
    pub correctives_emitted: AtomicU64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_offered(&self) {
        self.notifications_offered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.notifications_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failure(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emission(&self) {
        self.emissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self, count: u64) {
        self.unchanged_suppressed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_output_discarded(&self) {
        self.outputs_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrective(&self) {
        self.correctives_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            notifications_offered: self.notifications_offered.load(Ordering::Relaxed),
            notifications_accepted: self.notifications_accepted.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            batches_run: self.batches_run.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            emissions: self.emissions.load(Ordering::Relaxed),
            unchanged_suppressed: self.unchanged_suppressed.load(Ordering::Relaxed),
            outputs_discarded: self.outputs_discarded.load(Ordering::Relaxed),
            correctives_emitted: self.correctives_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Plain-number copy of [`RunMetrics`] at one observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub notifications_offered: u64,
    pub notifications_accepted: u64,
    pub stale_discarded: u64,
    pub batches_run: u64,
    pub batches_failed: u64,
    pub emissions: u64,
    pub unchanged_suppressed: u64,
    pub outputs_discarded: u64,
    pub correctives_emitted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = RunMetrics::new();
        m.record_offered();
        m.record_offered();
        m.record_accepted();
        m.record_batch();
        m.record_suppressed(3);

        let snap = m.snapshot();
        assert_eq!(snap.notifications_offered, 2);
        assert_eq!(snap.notifications_accepted, 1);
        assert_eq!(snap.batches_run, 1);
        assert_eq!(snap.unchanged_suppressed, 3);
        assert_eq!(snap.batches_failed, 0);
    }
}
