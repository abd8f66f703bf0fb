use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SALE_HISTORY_MAX_PAGES;
use crate::error::{AppError, Result};
use crate::market::{
    history_continues, json_number, now_unix_secs, parse_iso_to_unix_secs, parse_rarity, within_lookback,
};
use crate::market::{ListingQuery, MarketClient};
use crate::pool::BrowsedPool;
use crate::token::TokenProvider;
use crate::types::{ActivityRecord, Listing, Marketplace, Venue};

/// Only listings priced in this asset are compared.
const ASSET: &str = "TON";

const SALE_HISTORY_LIMIT: u32 = 50;
const SALE_KIND: &str = "SALE";

/// Tonnel is only reachable from inside a browser page, so every call goes through
/// the browsed pool.
pub struct TonnelClient {
    pool: Arc<BrowsedPool>,
    tokens: Arc<dyn TokenProvider>,
    api_url: String,
    origin: String,
    page_limit: u32,
}

impl TonnelClient {
    pub fn new(
        pool: Arc<BrowsedPool>,
        tokens: Arc<dyn TokenProvider>,
        api_url: &str,
        origin: &str,
        page_limit: u32,
    ) -> Self {
        Self {
            pool,
            tokens,
            api_url: api_url.trim_end_matches('/').to_string(),
            origin: origin.trim_end_matches('/').to_string(),
            page_limit,
        }
    }

    async fn token(&self, cancel: &CancellationToken) -> Result<String> {
        self.tokens.wait_for(Marketplace::Tonnel, cancel).await
    }
}

/// Server-side filter: priced, unsold, expected asset, plus any extra constraints.
fn listed_filter(extra: &[(&str, Value)]) -> String {
    let mut filter = json!({
        "price": { "$exists": true },
        "buyer": { "$exists": false },
        "asset": ASSET,
    });
    for (key, value) in extra {
        filter[*key] = value.clone();
    }
    filter.to_string()
}

/// Model and backdrop values carry a rarity suffix, so they are matched by prefix.
fn name_prefix(name: &str) -> Value {
    json!({ "$regex": format!("^{} \\(", regex::escape(name)) })
}

fn feed_body(page: u32, limit: u32, token: &str) -> Value {
    json!({
        "page": page,
        "limit": limit,
        "sort": json!({ "message_post_time": -1, "gift_id": -1 }).to_string(),
        "filter": listed_filter(&[]),
        "ref": 0,
        "price_range": Value::Null,
        "user_auth": token,
    })
}

fn floor_body(query: &ListingQuery, token: &str) -> Value {
    let mut extra = vec![
        ("gift_name", json!(query.collection)),
        ("model", name_prefix(&query.model)),
    ];
    if let Some(backdrop) = &query.backdrop {
        extra.push(("backdrop", name_prefix(backdrop)));
    }
    json!({
        "page": 1,
        "limit": 2,
        "sort": json!({ "price": 1, "gift_id": -1 }).to_string(),
        "filter": listed_filter(&extra),
        "ref": 0,
        "price_range": Value::Null,
        "user_auth": token,
    })
}

fn sale_history_body(query: &ListingQuery, token: &str, page: u32) -> Value {
    let mut filter = json!({ "gift_name": query.collection, "model": query.model });
    if let Some(backdrop) = &query.backdrop {
        filter["backdrop"] = json!(backdrop);
    }
    json!({
        "authData": token,
        "page": page,
        "limit": SALE_HISTORY_LIMIT,
        "type": SALE_KIND,
        "filter": filter,
        "sort": { "timestamp": -1, "gift_id": -1 },
    })
}

fn parse_listing(item: &Value) -> Result<Listing> {
    let gift_name = item
        .get("gift_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::MalformedListing("missing gift_name".to_string()))?;

    let model = item.get("model").and_then(Value::as_str).unwrap_or_default();
    let (model_name, model_pct) = parse_rarity(model)
        .ok_or_else(|| AppError::MalformedListing(format!("model without rarity: '{model}'")))?;

    let backdrop = item.get("backdrop").and_then(Value::as_str).unwrap_or_default();
    let (backdrop_name, backdrop_pct) = parse_rarity(backdrop)
        .ok_or_else(|| AppError::MalformedListing(format!("backdrop without rarity: '{backdrop}'")))?;

    let gift_id = item
        .get("gift_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| AppError::MalformedListing("missing gift_id".to_string()))?;
    if gift_id < 0 {
        return Err(AppError::MalformedListing(format!("negative gift_id {gift_id}")));
    }

    let price = json_number(item.get("price"))
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| AppError::MalformedListing(format!("gift {gift_id} has no usable price")))?;

    Ok(Listing {
        marketplace: Marketplace::Tonnel,
        collection_name: gift_name.to_string(),
        model_name,
        model_rarity_pct: model_pct,
        backdrop_name,
        backdrop_rarity_pct: backdrop_pct,
        price,
        external_id: gift_id.to_string(),
        raw_status: item
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("forsale")
            .to_string(),
        gift_number: item.get("gift_num").and_then(Value::as_u64),
    })
}

/// Sale rows carry an ISO timestamp; some carry epoch milliseconds instead.
fn parse_sale(item: &Value) -> Option<ActivityRecord> {
    let kind = item.get("type").and_then(Value::as_str)?;
    if !kind.eq_ignore_ascii_case(SALE_KIND) {
        return None;
    }
    let price = json_number(item.get("price"))?;
    let ts = item.get("timestamp")?;
    let timestamp = match ts.as_str() {
        Some(s) => parse_iso_to_unix_secs(s)?,
        None => {
            let n = ts.as_f64()?;
            if n > 1e12 { n / 1000.0 } else { n }
        }
    };
    Some(ActivityRecord {
        price,
        timestamp,
        kind: kind.to_ascii_lowercase(),
    })
}

#[async_trait]
impl MarketClient for TonnelClient {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Tonnel
    }

    fn page_slots(&self) -> usize {
        self.pool.len()
    }

    async fn fetch_feed_page(&self, page: u32, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let token = self.token(cancel).await?;
        let url = format!("{}/pageGifts", self.api_url);
        self.pool.post_json(&url, &feed_body(page, self.page_limit, &token), cancel).await
    }

    fn parse_feed_item(&self, item: &Value) -> Result<Listing> {
        parse_listing(item)
    }

    async fn floor_listings(&self, query: &ListingQuery, cancel: &CancellationToken) -> Result<Vec<Listing>> {
        let token = self.token(cancel).await?;
        let url = format!("{}/pageGifts", self.api_url);
        let items: Vec<Value> = self.pool.post_json(&url, &floor_body(query, &token), cancel).await?;

        let mut listings: Vec<Listing> = items
            .iter()
            .filter_map(|item| match parse_listing(item) {
                Ok(l) => Some(l),
                Err(e) => {
                    debug!("[TONNEL] skipping floor item: {e}");
                    None
                }
            })
            .collect();
        listings.sort_by(|a, b| a.price.total_cmp(&b.price));
        Ok(listings)
    }

    async fn recent_sales(
        &self,
        query: &ListingQuery,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ActivityRecord>> {
        let token = self.token(cancel).await?;
        let url = format!("{}/saleHistory", self.api_url);
        let now = now_unix_secs();
        let cutoff = now - lookback.as_secs_f64();

        let mut sales = Vec::new();
        for page in 1..=SALE_HISTORY_MAX_PAGES {
            let items: Vec<Value> = self
                .pool
                .post_json(&url, &sale_history_body(query, &token, page), cancel)
                .await?;
            let page_sales: Vec<ActivityRecord> = items.iter().filter_map(parse_sale).collect();
            let more = history_continues(items.len(), SALE_HISTORY_LIMIT, &page_sales, cutoff);
            sales.extend(page_sales);
            if !more {
                break;
            }
        }
        Ok(within_lookback(sales, now, lookback))
    }

    fn venue(&self, floor: Option<&Listing>) -> Venue {
        let site_url = match floor {
            Some(l) => format!("{}/?gift_id={}", self.origin, l.external_id),
            None => self.origin.clone(),
        };
        Venue::Tonnel { site_url }
    }
}
