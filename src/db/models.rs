/// Database row types matching `migrations/0001_signals.sql`.
use serde::Serialize;

use crate::error::Result;
use crate::types::Signal;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SignalRow {
    pub id: Option<i64>,
    pub detected_at: i64,
    pub direction: String,
    pub variant: String,
    pub collection_name: String,
    pub model_name: String,
    pub backdrop_name: String,
    pub dedup_key: String,
    pub percent_diff: f64,
    pub percent_diff_with_fee: Option<f64>,
    pub buy_market: String,
    pub buy_price: Option<f64>,
    pub sell_market: String,
    /// Second floor for same-market directions, the other market's floor otherwise.
    pub reference_price: Option<f64>,
    pub activity_level: String,
    /// Full signal as JSON.
    pub payload: String,
}

impl SignalRow {
    pub fn from_signal(s: &Signal) -> Result<Self> {
        let reference_price = if s.direction.is_cross_market() {
            s.sell_side.floor_price()
        } else {
            s.sell_side.second_floor_price()
        };
        Ok(Self {
            id: None,
            detected_at: s.detected_at_ns as i64,
            direction: s.direction.to_string(),
            variant: s.variant.to_string(),
            collection_name: s.collection_name.clone(),
            model_name: s.model_name.clone(),
            backdrop_name: s.backdrop_name.clone(),
            dedup_key: s.dedup_key.clone(),
            percent_diff: s.percent_diff,
            percent_diff_with_fee: s.percent_diff_with_fee,
            buy_market: s.buy_side.marketplace.to_string(),
            buy_price: s.buy_side.floor_price(),
            sell_market: s.sell_side.marketplace.to_string(),
            reference_price,
            activity_level: s.sell_side.activity_level.to_string(),
            payload: serde_json::to_string(s)?,
        })
    }
}
