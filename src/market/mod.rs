pub mod portals;
pub mod tonnel;

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ActivityRecord, Listing, Marketplace, Venue};

pub use portals::PortalsClient;
pub use tonnel::TonnelClient;

/// Which comparable listings to look up.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingQuery {
    pub collection: String,
    pub model: String,
    /// `None` matches any backdrop.
    pub backdrop: Option<String>,
}

/// One marketplace's listing feed, floor lookups and sale history.
#[async_trait]
pub trait MarketClient: Send + Sync {
    fn marketplace(&self) -> Marketplace;

    /// Feed pages fetched in parallel per scan, one per pool slot.
    fn page_slots(&self) -> usize;

    /// Raw feed items, newest listings first. Pages start at 1.
    async fn fetch_feed_page(&self, page: u32, cancel: &CancellationToken) -> Result<Vec<Value>>;

    /// Validate and normalize one raw feed item.
    fn parse_feed_item(&self, item: &Value) -> Result<Listing>;

    /// Cheapest matching listings, ascending by price (at most two are needed).
    async fn floor_listings(&self, query: &ListingQuery, cancel: &CancellationToken) -> Result<Vec<Listing>>;

    /// Completed sales within `lookback`, newest first.
    async fn recent_sales(
        &self,
        query: &ListingQuery,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ActivityRecord>>;

    fn venue(&self, floor: Option<&Listing>) -> Venue;
}

// ---------------------------------------------------------------------------
// Shared parsing helpers
// ---------------------------------------------------------------------------

fn rarity_regex() -> &'static Regex {
    static RARITY: OnceLock<Regex> = OnceLock::new();
    RARITY.get_or_init(|| {
        Regex::new(r"^(?P<name>.+?)\s*\(?\s*(?P<pct>\d+(?:\.\d+)?)\s*%\s*\)?$").expect("valid rarity pattern")
    })
}

/// `"Plum Pudding (1.5%)"` → `("Plum Pudding", 1.5)`.
pub fn parse_rarity(raw: &str) -> Option<(String, f64)> {
    let caps = rarity_regex().captures(raw.trim())?;
    let name = caps.name("name")?.as_str().trim().to_string();
    let pct = caps.name("pct")?.as_str().parse::<f64>().ok()?;
    if !name.chars().any(char::is_alphanumeric) {
        return None;
    }
    Some((name, pct))
}

/// Numbers arrive either as JSON numbers or decimal strings.
pub fn json_number(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Keep sales no older than `lookback` relative to `now`, newest first.
pub fn within_lookback(mut sales: Vec<ActivityRecord>, now: f64, lookback: Duration) -> Vec<ActivityRecord> {
    let cutoff = now - lookback.as_secs_f64();
    sales.retain(|s| s.timestamp >= cutoff);
    sales.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
    sales
}

/// Another history page is worth reading only after a full page whose sales all fall
/// inside the window. Pages are sorted newest first.
pub fn history_continues(raw_len: usize, page_limit: u32, page_sales: &[ActivityRecord], cutoff: f64) -> bool {
    raw_len >= page_limit as usize && page_sales.iter().all(|s| s.timestamp >= cutoff)
}

/// Parse an RFC 3339 / ISO 8601 timestamp to Unix seconds, honouring `Z` and
/// `±HH:MM` offsets. Fractional seconds are kept.
pub fn parse_iso_to_unix_secs(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.len() < 19 || !s.is_char_boundary(19) {
        return None;
    }
    let (date_time, rest) = s.split_at(19);
    let b = date_time.as_bytes();
    if b[4] != b'-' || b[7] != b'-' || !(b[10] == b'T' || b[10] == b' ') || b[13] != b':' || b[16] != b':' {
        return None;
    }
    let year: i64 = date_time[0..4].parse().ok()?;
    let month: i64 = date_time[5..7].parse().ok()?;
    let day: i64 = date_time[8..10].parse().ok()?;
    let hour: i64 = date_time[11..13].parse().ok()?;
    let minute: i64 = date_time[14..16].parse().ok()?;
    let second: i64 = date_time[17..19].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let (fraction, zone) = match rest.strip_prefix('.') {
        Some(r) => {
            let end = r.find(|c: char| !c.is_ascii_digit()).unwrap_or(r.len());
            let digits = &r[..end];
            let frac = if digits.is_empty() { 0.0 } else { format!("0.{digits}").parse().ok()? };
            (frac, &r[end..])
        }
        None => (0.0, rest),
    };

    let offset_secs: i64 = match zone {
        "" | "Z" | "z" => 0,
        z if z.len() == 6 && (z.starts_with('+') || z.starts_with('-')) && &z[3..4] == ":" => {
            let sign = if z.starts_with('-') { -1 } else { 1 };
            let h: i64 = z[1..3].parse().ok()?;
            let m: i64 = z[4..6].parse().ok()?;
            sign * (h * 3600 + m * 60)
        }
        _ => return None,
    };

    // Julian day number → days since the Unix epoch.
    let a = (14 - month) / 12;
    let y = year + 4800 - a;
    let m = month + 12 * a - 3;
    let jdn = day + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045;
    let unix_days = jdn - 2_440_588;
    let secs = unix_days * 86_400 + hour * 3_600 + minute * 60 + second - offset_secs;
    Some(secs as f64 + fraction)
}
