use std::collections::HashSet;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::types::{ActivityLevel, Direction, SignalFilter};

pub const TONNEL_API_URL: &str = "https://gifts2.tonnel.network/api";
pub const TONNEL_ORIGIN: &str = "https://market.tonnel.network/";
pub const PORTALS_API_URL: &str = "https://portals-market.com/api";
pub const SOLVER_API_URL: &str = "https://2captcha.com";
pub const METADATA_BASE_URL: &str = "https://t.me/nft";

/// Marketplace feed poll interval (seconds).
pub const SCAN_INTERVAL_SECS: u64 = 10;

/// Listings requested per feed page.
pub const SCAN_PAGE_LIMIT: u32 = 30;

/// Consecutive scan loop failures after which each further failure is logged as an error.
pub const SCAN_FAILURE_ESCALATION: u32 = 3;

/// Work queue capacity between scanners and evaluators.
pub const QUEUE_CAPACITY: usize = 256;

/// Channel capacity for signal routing (sink → consumer → DB writer).
pub const CHANNEL_CAPACITY: usize = 1024;

/// Attempt budgets per pooled request.
pub const DIRECT_MAX_ATTEMPTS: usize = 3;
pub const BROWSED_MAX_ATTEMPTS: usize = 5;

/// Wait between slot scans when every slot is busy or cooling.
pub const ACQUIRE_POLL_MS: u64 = 100;

/// Per-acquisition cooldown range on the direct pool (milliseconds, uniform).
pub const DIRECT_COOLDOWN_MS: (u64, u64) = (1_500, 3_000);

/// Per-acquisition cooldown on the browsed pool (milliseconds).
pub const BROWSED_COOLDOWN_MS: u64 = 1_500;

/// Cooldown applied to a browser slot after an HTTP 403.
pub const BLOCKED_COOLDOWN_SECS: u64 = 90;

/// Solver result poll interval.
pub const SOLVER_POLL_SECS: u64 = 2;

/// Upper bound a slot waits for a challenge token before resuming without one.
pub const CHALLENGE_TIMEOUT_SECS: u64 = 180;

/// Dedup TTLs: claimed on dequeue, re-set after a signal is emitted.
pub const DEDUP_TTL_SECS: u64 = 30 * 60;
pub const SIGNAL_DEDUP_TTL_SECS: u64 = 30 * 60;

/// Expired cache entries are purged on this interval.
pub const CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Sale activity lookback used by the evaluator.
pub const ACTIVITY_LOOKBACK_DAYS: u64 = 3;

/// Sale history is paged until a sale falls outside the lookback; this caps the pages
/// read per lookup, so very liquid items are sampled from their newest sales only.
pub const SALE_HISTORY_MAX_PAGES: u32 = 10;

/// Fixed absolute fee added to the buy price of cross-market comparisons.
pub const CROSS_MARKET_FEE: f64 = 0.36;

/// Token file re-read interval.
pub const TOKEN_REFRESH_SECS: u64 = 30;

/// Activity classification thresholds (sales within the lookback window).
pub mod activity_thresholds {
    pub const MEDIUM_MIN: usize = 5;
    pub const HIGH_MIN: usize = 10;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Proxy list, one `scheme:host:port:user:pass` per line (PROXIES_FILE)
    pub proxies_path: String,
    /// Max browser sessions; one per proxy from the head of the list (BROWSER_SESSIONS)
    pub browser_sessions: usize,
    /// Existing DevTools endpoint to attach to instead of launching (CHROME_WS_URL)
    pub chrome_ws_url: Option<String>,
    /// Browser binary launched when CHROME_WS_URL is unset (CHROME_PATH)
    pub chrome_path: String,
    pub tonnel_api_url: String,
    pub tonnel_origin: String,
    pub portals_api_url: String,
    pub metadata_base_url: String,
    pub solver_api_url: String,
    /// Required (SOLVER_API_KEY)
    pub solver_api_key: String,
    /// JSON file `{"tonnel": "...", "portals": "..."}` maintained by the auth flow (TOKEN_FILE)
    pub token_file: Option<String>,
    pub tonnel_auth: Option<String>,
    pub portals_auth: Option<String>,
    pub scan_interval: Duration,
    pub scan_page_limit: u32,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub cross_market_fee: f64,
    /// Signals below this percent diff are dropped (MIN_SIGNAL_PERCENT)
    pub min_signal_percent: f64,
    pub dedup_ttl: Duration,
    pub signal_dedup_ttl: Duration,
    pub signal_filter: SignalFilter,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let solver_api_key = std::env::var("SOLVER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AppError::Config("SOLVER_API_KEY must be set".to_string()))?;

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "signals.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            proxies_path: std::env::var("PROXIES_FILE").unwrap_or_else(|_| "proxies.txt".to_string()),
            browser_sessions: std::env::var("BROWSER_SESSIONS")
                .unwrap_or_else(|_| "4".to_string())
                .parse::<usize>()
                .map_err(|_| AppError::Config("BROWSER_SESSIONS must be an integer".to_string()))?,
            chrome_ws_url: std::env::var("CHROME_WS_URL").ok().filter(|s| !s.is_empty()),
            chrome_path: std::env::var("CHROME_PATH").unwrap_or_else(|_| "chromium".to_string()),
            tonnel_api_url: std::env::var("TONNEL_API_URL")
                .unwrap_or_else(|_| TONNEL_API_URL.to_string()),
            tonnel_origin: std::env::var("TONNEL_ORIGIN")
                .unwrap_or_else(|_| TONNEL_ORIGIN.to_string()),
            portals_api_url: std::env::var("PORTALS_API_URL")
                .unwrap_or_else(|_| PORTALS_API_URL.to_string()),
            metadata_base_url: std::env::var("METADATA_BASE_URL")
                .unwrap_or_else(|_| METADATA_BASE_URL.to_string()),
            solver_api_url: std::env::var("SOLVER_API_URL")
                .unwrap_or_else(|_| SOLVER_API_URL.to_string()),
            solver_api_key,
            token_file: std::env::var("TOKEN_FILE").ok().filter(|s| !s.is_empty()),
            tonnel_auth: std::env::var("TONNEL_AUTH").ok().filter(|s| !s.is_empty()),
            portals_auth: std::env::var("PORTALS_AUTH").ok().filter(|s| !s.is_empty()),
            scan_interval: Duration::from_secs(
                std::env::var("SCAN_INTERVAL_SECS")
                    .unwrap_or_default()
                    .parse::<u64>()
                    .unwrap_or(SCAN_INTERVAL_SECS),
            ),
            scan_page_limit: std::env::var("SCAN_PAGE_LIMIT")
                .unwrap_or_default()
                .parse::<u32>()
                .unwrap_or(SCAN_PAGE_LIMIT),
            worker_count: std::env::var("EVALUATOR_WORKERS")
                .unwrap_or_else(|_| "4".to_string())
                .parse::<usize>()
                .unwrap_or(4)
                .max(1),
            queue_capacity: std::env::var("QUEUE_CAPACITY")
                .unwrap_or_default()
                .parse::<usize>()
                .unwrap_or(QUEUE_CAPACITY)
                .max(1),
            cross_market_fee: std::env::var("CROSS_MARKET_FEE")
                .unwrap_or_default()
                .parse::<f64>()
                .unwrap_or(CROSS_MARKET_FEE),
            min_signal_percent: std::env::var("MIN_SIGNAL_PERCENT")
                .unwrap_or_default()
                .parse::<f64>()
                .unwrap_or(0.0),
            dedup_ttl: Duration::from_secs(DEDUP_TTL_SECS),
            signal_dedup_ttl: Duration::from_secs(SIGNAL_DEDUP_TTL_SECS),
            signal_filter: SignalFilter {
                directions: parse_set(
                    &std::env::var("SIGNAL_DIRECTIONS").unwrap_or_default(),
                    Direction::parse,
                    "SIGNAL_DIRECTIONS",
                )?,
                activity: parse_set(
                    &std::env::var("SIGNAL_ACTIVITY").unwrap_or_default(),
                    ActivityLevel::parse,
                    "SIGNAL_ACTIVITY",
                )?,
            },
        })
    }
}

/// Parse a comma-separated list into a set. An empty list means "everything allowed".
fn parse_set<T: std::hash::Hash + Eq>(
    raw: &str,
    parse: fn(&str) -> Option<T>,
    var: &str,
) -> Result<HashSet<T>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse(s).ok_or_else(|| AppError::Config(format!("{var}: unknown value '{s}'"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_set_accepts_known_values_and_rejects_unknown() {
        let set = parse_set(" tonnel_floor, portals_to_tonnel ", Direction::parse, "X").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&Direction::TonnelFloor));
        assert!(set.contains(&Direction::PortalsToTonnel));

        assert!(parse_set("", Direction::parse, "X").unwrap().is_empty());
        assert!(matches!(
            parse_set("sideways", Direction::parse, "X"),
            Err(AppError::Config(_))
        ));
    }
}
