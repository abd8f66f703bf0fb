//! In-memory latency histogram for pooled outbound requests.
//! Each pool records the wall time of every attempt, successful or not.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Shared latency stats. Pools record, API reads.
/// Values stored in microseconds.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: Option<u64>,
    pub p95_us: Option<u64>,
    pub p99_us: Option<u64>,
    pub max_us: Option<u64>,
}

impl LatencyStats {
    /// Tracks 1us to 10min, 3 significant figures. Challenge solves can take minutes.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 600_000_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        if let Ok(mut h) = self.inner.lock() {
            h.saturating_record(us.max(1));
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let Ok(h) = self.inner.lock() else {
            return LatencySummary { samples: 0, p50_us: None, p95_us: None, p99_us: None, max_us: None };
        };
        if h.len() == 0 {
            return LatencySummary { samples: 0, p50_us: None, p95_us: None, p99_us: None, max_us: None };
        }
        LatencySummary {
            samples: h.len(),
            p50_us: Some(h.value_at_quantile(0.5)),
            p95_us: Some(h.value_at_quantile(0.95)),
            p99_us: Some(h.value_at_quantile(0.99)),
            max_us: Some(h.max()),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let stats = LatencyStats::new();
        let s = stats.summary();
        assert_eq!(s.samples, 0);
        assert!(s.p50_us.is_none());
    }

    #[test]
    fn records_durations_in_microseconds() {
        let stats = LatencyStats::new();
        for ms in [1u64, 2, 3, 4, 100] {
            stats.record(Duration::from_millis(ms));
        }
        let s = stats.summary();
        assert_eq!(s.samples, 5);
        let p50 = s.p50_us.unwrap();
        assert!((2_900..=3_100).contains(&p50), "p50={p50}");
        assert!(s.max_us.unwrap() >= 99_000);
    }
}
