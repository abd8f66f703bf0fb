use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::db::writer::recent_signals;
use crate::error::AppError;
use crate::pool::{BrowsedPool, DirectPool};
use crate::queue::WorkQueueSender;
use crate::state::DedupCache;
use crate::types::{Direction, GiftCandidate};

const DEFAULT_SIGNAL_LIMIT: i64 = 50;
const MAX_SIGNAL_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
    pub health: Arc<HealthState>,
    pub dedup: Arc<DedupCache<String>>,
    pub queue: WorkQueueSender<GiftCandidate>,
    pub tonnel_pool: Arc<BrowsedPool>,
    pub portals_pool: Arc<DirectPool>,
    pub tonnel_latency: Arc<LatencyStats>,
    pub portals_latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/signals/recent", get(get_recent_signals))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RecentSignalsQuery {
    pub limit: Option<i64>,
    pub direction: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct PoolStatus {
    pub slots: usize,
    pub busy: usize,
    pub suspended: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pages_fetched: u64,
    pub page_failures: u64,
    pub listings_enqueued: u64,
    pub listings_rejected: u64,
    pub candidates_evaluated: u64,
    pub candidates_suppressed: u64,
    pub evaluation_failures: u64,
    pub signals_emitted: u64,
    pub last_signal_at_ns: Option<u64>,
    pub queue_depth: usize,
    pub dedup_entries: usize,
    pub tonnel_pool: PoolStatus,
    pub portals_pool: PoolStatus,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub tonnel: LatencySummary,
    pub portals: LatencySummary,
}

#[derive(Serialize)]
pub struct SignalResponse {
    pub id: i64,
    pub detected_at: i64,
    pub direction: String,
    pub variant: String,
    pub collection_name: String,
    pub model_name: String,
    pub backdrop_name: String,
    pub percent_diff: f64,
    pub percent_diff_with_fee: Option<f64>,
    pub buy_market: String,
    pub buy_price: Option<f64>,
    pub sell_market: String,
    pub reference_price: Option<f64>,
    pub activity_level: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let h = &state.health;
    let last_signal = HealthState::get(&h.last_signal_at_ns);
    let tonnel_closed = state.tonnel_pool.is_closed();

    Json(HealthResponse {
        status: if tonnel_closed { "degraded" } else { "ok" },
        pages_fetched: HealthState::get(&h.pages_fetched),
        page_failures: HealthState::get(&h.page_failures),
        listings_enqueued: HealthState::get(&h.listings_enqueued),
        listings_rejected: HealthState::get(&h.listings_rejected),
        candidates_evaluated: HealthState::get(&h.candidates_evaluated),
        candidates_suppressed: HealthState::get(&h.candidates_suppressed),
        evaluation_failures: HealthState::get(&h.evaluation_failures),
        signals_emitted: HealthState::get(&h.signals_emitted),
        last_signal_at_ns: (last_signal > 0).then_some(last_signal),
        queue_depth: state.queue.depth(),
        dedup_entries: state.dedup.len(),
        tonnel_pool: PoolStatus {
            slots: state.tonnel_pool.len(),
            busy: state.tonnel_pool.busy_count(),
            suspended: state.tonnel_pool.suspended_count(),
        },
        portals_pool: PoolStatus {
            slots: state.portals_pool.len(),
            busy: state.portals_pool.busy_count(),
            suspended: 0,
        },
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    Json(LatencyResponse {
        tonnel: state.tonnel_latency.summary(),
        portals: state.portals_latency.summary(),
    })
}

async fn get_recent_signals(
    State(state): State<ApiState>,
    Query(params): Query<RecentSignalsQuery>,
) -> Result<Json<Vec<SignalResponse>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_SIGNAL_LIMIT).clamp(1, MAX_SIGNAL_LIMIT);
    let direction = match params.direction.as_deref().filter(|d| !d.is_empty()) {
        Some(raw) => Some(
            Direction::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown direction '{raw}'")))?
                .to_string(),
        ),
        None => None,
    };

    let rows = recent_signals(&state.pool, limit, direction.as_deref()).await?;

    let signals = rows
        .into_iter()
        .map(|r| SignalResponse {
            id: r.id.unwrap_or(0),
            detected_at: r.detected_at,
            direction: r.direction,
            variant: r.variant,
            collection_name: r.collection_name,
            model_name: r.model_name,
            backdrop_name: r.backdrop_name,
            percent_diff: r.percent_diff,
            percent_diff_with_fee: r.percent_diff_with_fee,
            buy_market: r.buy_market,
            buy_price: r.buy_price,
            sell_market: r.sell_market,
            reference_price: r.reference_price,
            activity_level: r.activity_level,
            payload: serde_json::from_str(&r.payload).unwrap_or(serde_json::Value::Null),
        })
        .collect();

    Ok(Json(signals))
}
