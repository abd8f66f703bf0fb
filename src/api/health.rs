//! Shared health state for the /health endpoint.
//! Updated by the scanners, evaluator workers, and the signal consumer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters. Updated by scanner components, read by API.
#[derive(Default)]
pub struct HealthState {
    pub pages_fetched: AtomicU64,
    pub page_failures: AtomicU64,
    pub listings_enqueued: AtomicU64,
    pub listings_rejected: AtomicU64,
    pub candidates_evaluated: AtomicU64,
    pub candidates_suppressed: AtomicU64,
    pub evaluation_failures: AtomicU64,
    pub signals_emitted: AtomicU64,
    /// Nanosecond timestamp of the last emitted signal (0 = none).
    pub last_signal_at_ns: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn set_last_signal_at_ns(&self, ns: u64) {
        self.last_signal_at_ns.store(ns, Ordering::Relaxed);
    }
}
