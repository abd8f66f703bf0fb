use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::config::SCAN_FAILURE_ESCALATION;
use crate::error::{AppError, Result};
use crate::market::MarketClient;
use crate::queue::WorkQueueSender;
use crate::types::GiftCandidate;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanStats {
    pub pages_ok: usize,
    pub pages_failed: usize,
    pub enqueued: usize,
    pub rejected: usize,
}

/// Polls one marketplace's listing feed and feeds the work queue.
pub struct MarketScanner {
    client: Arc<dyn MarketClient>,
    queue: WorkQueueSender<GiftCandidate>,
    health: Arc<HealthState>,
    every: Duration,
}

impl MarketScanner {
    pub fn new(
        client: Arc<dyn MarketClient>,
        queue: WorkQueueSender<GiftCandidate>,
        health: Arc<HealthState>,
        every: Duration,
    ) -> Self {
        Self { client, queue, health, every }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let market = self.client.marketplace();
        let mut ticker = interval(self.every);
        let mut consecutive_failures: u32 = 0;
        info!(%market, every_secs = self.every.as_secs(), "[SCANNER] started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.scan_once(&cancel).await {
                Ok(stats) => {
                    consecutive_failures = 0;
                    debug!(
                        %market,
                        pages = stats.pages_ok,
                        failed_pages = stats.pages_failed,
                        enqueued = stats.enqueued,
                        rejected = stats.rejected,
                        "[SCANNER] scan complete"
                    );
                }
                Err(AppError::Cancelled) => break,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= SCAN_FAILURE_ESCALATION {
                        error!(%market, consecutive_failures, "[SCANNER] scan failed repeatedly: {e}");
                    } else {
                        warn!(%market, consecutive_failures, "[SCANNER] scan failed: {e}");
                    }
                }
            }
        }
        info!(%market, "[SCANNER] stopped");
    }

    /// One feed page per pool slot, fetched in parallel. Fails only when every page failed.
    pub async fn scan_once(&self, cancel: &CancellationToken) -> Result<ScanStats> {
        let market = self.client.marketplace();
        let pages = self.client.page_slots().max(1) as u32;
        let results = join_all((1..=pages).map(|page| self.client.fetch_feed_page(page, cancel))).await;

        let mut stats = ScanStats::default();
        let mut last_error = None;

        for (page, result) in (1..=pages).zip(results) {
            let items = match result {
                Ok(items) => items,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!(%market, page, "[SCANNER] page fetch failed: {e}");
                    HealthState::inc(&self.health.page_failures);
                    stats.pages_failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };
            stats.pages_ok += 1;
            HealthState::inc(&self.health.pages_fetched);

            for item in &items {
                let listing = match self.client.parse_feed_item(item) {
                    Ok(l) => l,
                    Err(e) => {
                        debug!(%market, page, "[SCANNER] rejected item: {e}");
                        HealthState::inc(&self.health.listings_rejected);
                        stats.rejected += 1;
                        continue;
                    }
                };
                let candidate = GiftCandidate::from_listing(&listing);
                let key = candidate.dedup_key.clone();
                match self.queue.push(candidate, cancel).await {
                    Ok(()) => {
                        HealthState::inc(&self.health.listings_enqueued);
                        stats.enqueued += 1;
                    }
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => warn!(%market, dedup_key = %key, "[SCANNER] enqueue failed: {e}"),
                }
            }
        }

        match last_error {
            Some(e) if stats.pages_ok == 0 => Err(e),
            _ => Ok(stats),
        }
    }
}
