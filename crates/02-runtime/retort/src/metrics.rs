//! Per-site counters in the relaxed-atomics style of the port metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub(crate) struct SiteMetrics {
    emitted: AtomicU64,
    fired: AtomicU64,
    replied: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

impl SiteMetrics {
    pub(crate) fn record_emit(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fire(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reply(&self) {
        self.replied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SiteMetricsSnapshot {
        SiteMetricsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a site's counters, serializable for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SiteMetricsSnapshot {
    /// Values emitted into the bag (all molecule kinds).
    pub emitted: u64,
    /// Reaction instances scheduled on the pool.
    pub fired: u64,
    /// Replies delivered to blocking callers.
    pub replied: u64,
    /// Blocking calls that withdrew after their deadline.
    pub timed_out: u64,
    /// Reaction bodies that failed or panicked.
    pub failed: u64,
}
