use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::{GiftMetadata, RarityAttr};

/// Element class present only on gifts that have changed hands before.
const PRIOR_SALE_MARKER: &str = "tgme_gift_sale";

/// Reads rarity, supply and prior-sale data from the public gift page.
pub struct MetadataResolver {
    http: reqwest::Client,
    base_url: String,
}

impl MetadataResolver {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `Plush Pepe` #12 → `{base}/PlushPepe-12`.
    pub fn page_url(&self, collection: &str, number: u64) -> String {
        let slug: String = collection.chars().filter(|c| c.is_alphanumeric()).collect();
        format!("{}/{slug}-{number}", self.base_url)
    }

    pub async fn resolve(&self, collection: &str, number: u64, cancel: &CancellationToken) -> Result<GiftMetadata> {
        let url = self.page_url(collection, number);
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = self.http.get(&url).send() => r?,
        };
        if !resp.status().is_success() {
            return Err(AppError::MetadataMissing(format!("{url}: HTTP {}", resp.status())));
        }
        let html = resp.text().await?;
        let meta = parse_gift_page(&html).map_err(|e| match e {
            AppError::MetadataMissing(field) => AppError::MetadataMissing(format!("{url}: {field}")),
            other => other,
        })?;
        debug!(%url, issued = meta.issued, total = meta.total, "[META] resolved");
        Ok(meta)
    }
}

fn row_regex() -> &'static Regex {
    static ROW: OnceLock<Regex> = OnceLock::new();
    ROW.get_or_init(|| {
        Regex::new(r"(?s)<th[^>]*>\s*(?P<label>[^<]+?)\s*</th>\s*<td[^>]*>(?P<value>.*?)</td>").expect("valid row pattern")
    })
}

fn mark_regex() -> &'static Regex {
    static MARK: OnceLock<Regex> = OnceLock::new();
    MARK.get_or_init(|| {
        Regex::new(r"(?s)^(?P<name>.*?)\s*<mark[^>]*>\s*(?P<pct>\d+(?:[.,]\d+)?)\s*%\s*</mark>")
            .expect("valid mark pattern")
    })
}

fn supply_regex() -> &'static Regex {
    static SUPPLY: OnceLock<Regex> = OnceLock::new();
    SUPPLY.get_or_init(|| Regex::new(r"(?P<issued>\d+)/(?P<total>\d+)").expect("valid supply pattern"))
}

fn decode_entities(s: &str) -> String {
    s.replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn rarity_row(rows: &HashMap<String, String>, label: &str) -> Result<RarityAttr> {
    let value = rows
        .get(label)
        .ok_or_else(|| AppError::MetadataMissing(format!("no {label} row")))?;
    let caps = mark_regex()
        .captures(value.trim())
        .ok_or_else(|| AppError::MetadataMissing(format!("{label} has no rarity")))?;
    let name = decode_entities(caps["name"].trim());
    let rarity_pct = caps["pct"]
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| AppError::MetadataMissing(format!("{label} rarity unreadable")))?;
    if name.is_empty() {
        return Err(AppError::MetadataMissing(format!("{label} has no name")));
    }
    Ok(RarityAttr { name, rarity_pct })
}

/// Parse the gift table (Model, Backdrop, Symbol, Quantity) and the prior-sale marker.
pub fn parse_gift_page(html: &str) -> Result<GiftMetadata> {
    let rows: HashMap<String, String> = row_regex()
        .captures_iter(html)
        .map(|c| (c["label"].trim().to_string(), c["value"].to_string()))
        .collect();

    let quantity = rows
        .get("Quantity")
        .ok_or_else(|| AppError::MetadataMissing("no Quantity row".to_string()))?;
    let compact: String = decode_entities(quantity)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '\u{a0}')
        .collect();
    let supply = supply_regex()
        .captures(&compact)
        .ok_or_else(|| AppError::MetadataMissing("Quantity is not issued/total".to_string()))?;
    let issued = supply["issued"]
        .parse()
        .map_err(|_| AppError::MetadataMissing("issued count unreadable".to_string()))?;
    let total = supply["total"]
        .parse()
        .map_err(|_| AppError::MetadataMissing("total count unreadable".to_string()))?;

    Ok(GiftMetadata {
        model: rarity_row(&rows, "Model")?,
        backdrop: rarity_row(&rows, "Backdrop")?,
        symbol: rarity_row(&rows, "Symbol")?,
        issued,
        total,
        previously_sold: html.contains(PRIOR_SALE_MARKER),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::{extract::Path, http::StatusCode, routing::get, Router};

    const PAGE: &str = r##"
<div class="tgme_gift_preview"></div>
<table class="tgme_gift_table">
  <tr><th>Owner</th><td><a href="#">someone</a></td></tr>
  <tr><th>Model</th><td>Cozy Galaxy <mark>1.5%</mark></td></tr>
  <tr><th>Backdrop</th><td>Onyx Black <mark>2%</mark></td></tr>
  <tr><th>Symbol</th><td>Durov&#39;s Star <mark>0.4%</mark></td></tr>
  <tr><th>Quantity</th><td>1 234/5 000 issued</td></tr>
</table>
"##;

    #[test]
    fn parses_the_gift_table() {
        let m = parse_gift_page(PAGE).unwrap();
        assert_eq!(m.model, RarityAttr { name: "Cozy Galaxy".to_string(), rarity_pct: 1.5 });
        assert_eq!(m.backdrop.rarity_pct, 2.0);
        assert_eq!(m.symbol.name, "Durov's Star");
        assert_eq!((m.issued, m.total), (1_234, 5_000));
        assert!(!m.previously_sold);
    }

    #[test]
    fn prior_sale_marker_is_detected() {
        let html = format!(r#"{PAGE}<div class="tgme_gift_sale">Sold for 100 TON</div>"#);
        assert!(parse_gift_page(&html).unwrap().previously_sold);
    }

    #[test]
    fn missing_rows_are_metadata_errors() {
        let no_symbol = PAGE.replace("<tr><th>Symbol</th><td>Durov&#39;s Star <mark>0.4%</mark></td></tr>", "");
        assert!(matches!(parse_gift_page(&no_symbol), Err(AppError::MetadataMissing(_))));
        assert!(matches!(parse_gift_page("<html></html>"), Err(AppError::MetadataMissing(_))));
    }

    #[test]
    fn page_url_strips_punctuation() {
        let r = MetadataResolver::with_client(reqwest::Client::new(), "https://t.me/nft/");
        assert_eq!(r.page_url("Durov's Cap", 42), "https://t.me/nft/DurovsCap-42");
    }

    #[tokio::test]
    async fn resolves_over_http_and_reports_missing_gifts() {
        let app = Router::new().route(
            "/:slug",
            get(|Path(slug): Path<String>| async move {
                if slug == "PlushPepe-7" {
                    Ok(PAGE)
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        );
        let base = serve(app).await;
        let resolver = MetadataResolver::with_client(reqwest::Client::builder().no_proxy().build().unwrap(), &base);

        let meta = resolver.resolve("Plush Pepe", 7, &CancellationToken::new()).await.unwrap();
        assert_eq!(meta.model.name, "Cozy Galaxy");

        let missing = resolver.resolve("Plush Pepe", 8, &CancellationToken::new()).await;
        assert!(matches!(missing, Err(AppError::MetadataMissing(_))));
    }
}
