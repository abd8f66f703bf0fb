use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SALE_HISTORY_MAX_PAGES;
use crate::error::{AppError, Result};
use crate::market::{history_continues, json_number, now_unix_secs, parse_iso_to_unix_secs, within_lookback};
use crate::market::{ListingQuery, MarketClient};
use crate::pool::DirectPool;
use crate::token::TokenProvider;
use crate::types::{ActivityRecord, Attribute, Listing, Marketplace, Venue};

const ACTIVITY_LIMIT: u32 = 50;
const BUY_ACTION: &str = "buy";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ActionsResponse {
    #[serde(default)]
    actions: Vec<Value>,
}

pub struct PortalsClient {
    pool: Arc<DirectPool>,
    tokens: Arc<dyn TokenProvider>,
    api_url: String,
    page_limit: u32,
}

impl PortalsClient {
    pub fn new(pool: Arc<DirectPool>, tokens: Arc<dyn TokenProvider>, api_url: &str, page_limit: u32) -> Self {
        Self {
            pool,
            tokens,
            api_url: api_url.trim_end_matches('/').to_string(),
            page_limit,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let token = self.tokens.wait_for(Marketplace::Portals, cancel).await?;
        let url = reqwest::Url::parse_with_params(&format!("{}/{path}", self.api_url), params)
            .map_err(|e| AppError::Config(format!("invalid Portals URL: {e}")))?;
        self.pool
            .get_json(url.as_str(), &[("Authorization", format!("tma {token}"))], cancel)
            .await
    }
}

fn filter_params(query: &ListingQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("filter_by_collections", query.collection.clone()),
        ("filter_by_models", query.model.clone()),
    ];
    if let Some(backdrop) = &query.backdrop {
        params.push(("filter_by_backdrops", backdrop.clone()));
    }
    params
}

/// `rarity_per_mille` → percent.
fn attribute(item: &Value, kind: &str) -> Option<(String, Option<f64>)> {
    item.get("attributes")?
        .as_array()?
        .iter()
        .find(|a| a.get("type").and_then(Value::as_str) == Some(kind))
        .and_then(|a| {
            let value = a.get("value")?.as_str()?.trim();
            if value.is_empty() {
                return None;
            }
            Some((value.to_string(), json_number(a.get("rarity_per_mille")).map(|pm| pm / 10.0)))
        })
}

fn parse_listing(item: &Value) -> Result<Listing> {
    let id = item
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::MalformedListing("missing id".to_string()))?;

    let name = item
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::MalformedListing(format!("nft {id} has no name")))?;

    let (model_name, model_pct) = match attribute(item, "model") {
        Some((name, Some(pct))) => (name, pct),
        _ => return Err(AppError::MalformedListing(format!("nft {id} has no model rarity"))),
    };
    let (backdrop_name, backdrop_pct) = match attribute(item, "backdrop") {
        Some((name, Some(pct))) => (name, pct),
        _ => return Err(AppError::MalformedListing(format!("nft {id} has no backdrop rarity"))),
    };

    let price = json_number(item.get("price"))
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| AppError::MalformedListing(format!("nft {id} has no usable price")))?;

    Ok(Listing {
        marketplace: Marketplace::Portals,
        collection_name: name.to_string(),
        model_name,
        model_rarity_pct: model_pct,
        backdrop_name,
        backdrop_rarity_pct: backdrop_pct,
        price,
        external_id: id.to_string(),
        raw_status: item
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("listed")
            .to_string(),
        gift_number: item.get("external_collection_number").and_then(Value::as_u64),
    })
}

fn parse_action(item: &Value) -> Option<ActivityRecord> {
    let kind = item.get("type").and_then(Value::as_str)?;
    if kind != BUY_ACTION {
        return None;
    }
    Some(ActivityRecord {
        price: json_number(item.get("amount"))?,
        timestamp: parse_iso_to_unix_secs(item.get("created_at")?.as_str()?)?,
        kind: kind.to_string(),
    })
}

#[async_trait]
impl MarketClient for PortalsClient {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Portals
    }

    fn page_slots(&self) -> usize {
        self.pool.len()
    }

    async fn fetch_feed_page(&self, page: u32, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let offset = page.saturating_sub(1) * self.page_limit;
        let params = [
            ("offset", offset.to_string()),
            ("limit", self.page_limit.to_string()),
            ("sort_by", "listed_at desc".to_string()),
            ("status", "listed".to_string()),
        ];
        let resp: SearchResponse = self.get("nfts/search", &params, cancel).await?;
        Ok(resp.results)
    }

    fn parse_feed_item(&self, item: &Value) -> Result<Listing> {
        parse_listing(item)
    }

    async fn floor_listings(&self, query: &ListingQuery, cancel: &CancellationToken) -> Result<Vec<Listing>> {
        let mut params = vec![
            ("offset", "0".to_string()),
            ("limit", "2".to_string()),
            ("sort_by", "price asc".to_string()),
            ("status", "listed".to_string()),
        ];
        params.extend(filter_params(query));
        let resp: SearchResponse = self.get("nfts/search", &params, cancel).await?;

        let mut listings: Vec<Listing> = resp
            .results
            .iter()
            .filter_map(|item| match parse_listing(item) {
                Ok(l) => Some(l),
                Err(e) => {
                    debug!("[PORTALS] skipping floor item: {e}");
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
        let now = now_unix_secs();
        let cutoff = now - lookback.as_secs_f64();

        let mut sales = Vec::new();
        for page in 0..SALE_HISTORY_MAX_PAGES {
            let mut params = vec![
                ("offset", (page * ACTIVITY_LIMIT).to_string()),
                ("limit", ACTIVITY_LIMIT.to_string()),
                ("sort_by", "listed_at desc".to_string()),
                ("action_types", BUY_ACTION.to_string()),
            ];
            params.extend(filter_params(query));
            let resp: ActionsResponse = self.get("market/actions/", &params, cancel).await?;
            let page_sales: Vec<ActivityRecord> = resp.actions.iter().filter_map(parse_action).collect();
            let more = history_continues(resp.actions.len(), ACTIVITY_LIMIT, &page_sales, cutoff);
            sales.extend(page_sales);
            if !more {
                break;
            }
        }
        Ok(within_lookback(sales, now, lookback))
    }

    fn venue(&self, floor: Option<&Listing>) -> Venue {
        let attributes = floor
            .map(|l| {
                vec![
                    Attribute {
                        kind: "model".to_string(),
                        value: l.model_name.clone(),
                        rarity_pct: Some(l.model_rarity_pct),
                    },
                    Attribute {
                        kind: "backdrop".to_string(),
                        value: l.backdrop_name.clone(),
                        rarity_pct: Some(l.backdrop_rarity_pct),
                    },
                ]
            })
            .unwrap_or_default();
        Venue::Portals { attributes }
    }
}
