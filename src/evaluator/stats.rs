//! Sale-history statistics attached to each market snapshot.

use crate::types::{ActivityLevel, ActivityRecord, LastSale};

/// Linear-interpolated percentile, `p` in 0..=100.
///
/// rank = (n − 1)·p/100 + 1 (1-indexed). rank ≤ 1 gives the minimum, rank ≥ n the
/// maximum, anything between interpolates `floor(rank)` toward `floor(rank) + 1`.
/// `[10, 20, 30, 40, 100]` at p25 is 20; p50 of an odd-length sample is its median.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();

    let rank = (n as f64 - 1.0) * p / 100.0 + 1.0;
    if rank <= 1.0 {
        return Some(sorted[0]);
    }
    if rank >= n as f64 {
        return Some(sorted[n - 1]);
    }
    let lower = rank.floor();
    let frac = rank - lower;
    let i = lower as usize;
    Some(sorted[i - 1] + frac * (sorted[i] - sorted[i - 1]))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityStats {
    pub percentile_25: Option<f64>,
    pub percentile_75: Option<f64>,
    pub max_price: Option<f64>,
    pub last_sale: Option<LastSale>,
    pub level: ActivityLevel,
}

pub fn activity_stats(records: &[ActivityRecord]) -> ActivityStats {
    let prices: Vec<f64> = records.iter().map(|r| r.price).collect();
    ActivityStats {
        percentile_25: percentile(&prices, 25.0),
        percentile_75: percentile(&prices, 75.0),
        max_price: prices.iter().copied().reduce(f64::max),
        last_sale: records
            .iter()
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .map(|r| LastSale {
                price: r.price,
                timestamp: r.timestamp,
            }),
        level: ActivityLevel::from_sale_count(records.len()),
    }
}
