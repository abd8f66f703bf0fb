use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::evaluator::signal::{compute_diffs, select_direction};
use crate::evaluator::stats::activity_stats;
use crate::market::{ListingQuery, MarketClient};
use crate::metadata::MetadataResolver;
use crate::queue::WorkQueueReceiver;
use crate::sink::SignalSink;
use crate::state::DedupCache;
use crate::types::{GiftCandidate, GiftMetadata, Marketplace, MarketSnapshot, MatchVariant, Signal, SignalFilter};

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    /// Claim held from dequeue onward.
    pub dedup_ttl: Duration,
    /// Re-applied after a signal is emitted (never shortens the claim).
    pub signal_ttl: Duration,
    pub lookback: Duration,
    pub cross_market_fee: f64,
    pub min_signal_percent: f64,
    pub filter: SignalFilter,
}

impl EvaluatorSettings {
    pub fn from_config(cfg: &Config, lookback: Duration) -> Self {
        Self {
            dedup_ttl: cfg.dedup_ttl,
            signal_ttl: cfg.signal_dedup_ttl,
            lookback,
            cross_market_fee: cfg.cross_market_fee,
            min_signal_percent: cfg.min_signal_percent,
            filter: cfg.signal_filter.clone(),
        }
    }
}

/// Turns queued candidates into signals. Shared by every worker task.
pub struct ArbitrageEvaluator {
    tonnel: Arc<dyn MarketClient>,
    portals: Arc<dyn MarketClient>,
    metadata: Option<Arc<MetadataResolver>>,
    sink: Arc<dyn SignalSink>,
    dedup: Arc<DedupCache<String>>,
    health: Arc<HealthState>,
    settings: EvaluatorSettings,
}

impl ArbitrageEvaluator {
    pub fn new(
        tonnel: Arc<dyn MarketClient>,
        portals: Arc<dyn MarketClient>,
        metadata: Option<Arc<MetadataResolver>>,
        sink: Arc<dyn SignalSink>,
        dedup: Arc<DedupCache<String>>,
        health: Arc<HealthState>,
        settings: EvaluatorSettings,
    ) -> Self {
        Self { tonnel, portals, metadata, sink, dedup, health, settings }
    }

    fn client(&self, market: Marketplace) -> &Arc<dyn MarketClient> {
        match market {
            Marketplace::Tonnel => &self.tonnel,
            Marketplace::Portals => &self.portals,
        }
    }

    /// Evaluate one candidate. Returns the number of signals emitted; 0 when the
    /// dedup key was already claimed.
    pub async fn evaluate(&self, candidate: &GiftCandidate, cancel: &CancellationToken) -> Result<usize> {
        if !self.dedup.try_claim(candidate.dedup_key.clone(), self.settings.dedup_ttl) {
            HealthState::inc(&self.health.candidates_suppressed);
            debug!(dedup_key = %candidate.dedup_key, "[EVAL] suppressed");
            return Ok(0);
        }
        HealthState::inc(&self.health.candidates_evaluated);

        let metadata = self.resolve_metadata(candidate, cancel).await?;

        let mut emitted = 0;
        for variant in [MatchVariant::WithBackdrop, MatchVariant::ModelOnly] {
            if let Some(signal) = self.evaluate_variant(candidate, variant, metadata.as_ref(), cancel).await? {
                self.sink.emit(signal).await;
                // Holds even if a later variant fails.
                self.dedup.set(candidate.dedup_key.clone(), self.settings.signal_ttl);
                HealthState::inc(&self.health.signals_emitted);
                self.health.set_last_signal_at_ns(now_ns());
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Best effort: a missing page never blocks evaluation.
    async fn resolve_metadata(
        &self,
        candidate: &GiftCandidate,
        cancel: &CancellationToken,
    ) -> Result<Option<GiftMetadata>> {
        let (Some(resolver), Some(number)) = (&self.metadata, candidate.gift_number) else {
            return Ok(None);
        };
        match resolver.resolve(&candidate.collection_name, number, cancel).await {
            Ok(meta) => Ok(Some(meta)),
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(e) => {
                debug!(dedup_key = %candidate.dedup_key, "[EVAL] metadata unavailable: {e}");
                Ok(None)
            }
        }
    }

    async fn snapshot(
        &self,
        market: Marketplace,
        query: &ListingQuery,
        metadata: Option<&GiftMetadata>,
        cancel: &CancellationToken,
    ) -> Result<MarketSnapshot> {
        let client = self.client(market);
        let mut floors = client.floor_listings(query, cancel).await?.into_iter();
        let activity = client.recent_sales(query, self.settings.lookback, cancel).await?;

        let floor = floors.next();
        let second_floor = floors.next();
        let stats = activity_stats(&activity);
        Ok(MarketSnapshot {
            marketplace: market,
            venue: client.venue(floor.as_ref()),
            floor,
            second_floor,
            activity,
            percentile_25: stats.percentile_25,
            percentile_75: stats.percentile_75,
            max_activity_price: stats.max_price,
            last_sale: stats.last_sale,
            activity_level: stats.level,
            metadata: metadata.cloned(),
        })
    }

    async fn evaluate_variant(
        &self,
        candidate: &GiftCandidate,
        variant: MatchVariant,
        metadata: Option<&GiftMetadata>,
        cancel: &CancellationToken,
    ) -> Result<Option<Signal>> {
        let query = ListingQuery {
            collection: candidate.collection_name.clone(),
            model: candidate.model_name.clone(),
            backdrop: match variant {
                MatchVariant::WithBackdrop => Some(candidate.backdrop_name.clone()),
                MatchVariant::ModelOnly => None,
            },
        };

        // One sub-fetch at a time per candidate keeps pool contention predictable.
        let tonnel = self.snapshot(Marketplace::Tonnel, &query, metadata, cancel).await?;
        let portals = self.snapshot(Marketplace::Portals, &query, metadata, cancel).await?;

        let diffs = compute_diffs(&tonnel, &portals, self.settings.cross_market_fee);
        let Some(best) = select_direction(&diffs) else {
            debug!(dedup_key = %candidate.dedup_key, %variant, "[EVAL] no profitable direction");
            return Ok(None);
        };

        let direction = best.direction;
        let (buy_side, sell_side) = match (direction.buy_market(), direction.reference_market()) {
            (Marketplace::Tonnel, Marketplace::Tonnel) => (tonnel.clone(), tonnel),
            (Marketplace::Portals, Marketplace::Portals) => (portals.clone(), portals),
            (Marketplace::Tonnel, Marketplace::Portals) => (tonnel, portals),
            (Marketplace::Portals, Marketplace::Tonnel) => (portals, tonnel),
        };

        if best.percent_diff < self.settings.min_signal_percent
            || !self.settings.filter.allows(direction, sell_side.activity_level)
        {
            debug!(
                dedup_key = %candidate.dedup_key,
                %variant,
                %direction,
                percent_diff = best.percent_diff,
                activity = %sell_side.activity_level,
                "[EVAL] filtered out"
            );
            return Ok(None);
        }

        Ok(Some(Signal {
            direction,
            variant,
            collection_name: candidate.collection_name.clone(),
            model_name: candidate.model_name.clone(),
            backdrop_name: candidate.backdrop_name.clone(),
            dedup_key: candidate.dedup_key.clone(),
            percent_diff: best.percent_diff,
            percent_diff_with_fee: best.percent_diff_with_fee,
            buy_side,
            sell_side,
            detected_at_ns: now_ns(),
        }))
    }

    /// Start `count` worker tasks draining `queue` until cancelled.
    pub fn spawn_workers(
        self: Arc<Self>,
        count: usize,
        queue: WorkQueueReceiver<GiftCandidate>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|id| tokio::spawn(Arc::clone(&self).run_worker(id, queue.clone(), cancel.clone())))
            .collect()
    }

    async fn run_worker(self: Arc<Self>, id: usize, queue: WorkQueueReceiver<GiftCandidate>, cancel: CancellationToken) {
        debug!(worker = id, "[EVAL] worker started");
        while let Some(candidate) = queue.pop(&cancel).await {
            let outcome = AssertUnwindSafe(self.evaluate(&candidate, &cancel))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => info!(worker = id, dedup_key = %candidate.dedup_key, signals = n, "[EVAL] signals emitted"),
                Ok(Err(AppError::Cancelled)) => break,
                Ok(Err(e)) => {
                    // The claim stays: the candidate is skipped until its key expires.
                    HealthState::inc(&self.health.evaluation_failures);
                    warn!(
                        worker = id,
                        dedup_key = %candidate.dedup_key,
                        collection = %candidate.collection_name,
                        model = %candidate.model_name,
                        "[EVAL] evaluation failed: {e}"
                    );
                }
                Err(_) => {
                    HealthState::inc(&self.health.evaluation_failures);
                    error!(
                        worker = id,
                        dedup_key = %candidate.dedup_key,
                        collection = %candidate.collection_name,
                        model = %candidate.model_name,
                        "[EVAL] evaluation panicked"
                    );
                }
            }
        }
        debug!(worker = id, "[EVAL] worker stopped");
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::work_queue;
    use crate::types::{ActivityLevel, ActivityRecord, Direction, Listing, Venue};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Fixed floors per variant; `fail_on`/`panic_on` trigger for one collection,
    /// `fail_model_only` for every query without a backdrop.
    struct FakeMarket {
        market: Marketplace,
        with_backdrop: Vec<f64>,
        model_only: Vec<f64>,
        sales: Vec<f64>,
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
        fail_model_only: bool,
    }

    impl FakeMarket {
        fn new(market: Marketplace, with_backdrop: &[f64], model_only: &[f64]) -> Self {
            Self {
                market,
                with_backdrop: with_backdrop.to_vec(),
                model_only: model_only.to_vec(),
                sales: Vec::new(),
                fail_on: None,
                panic_on: None,
                fail_model_only: false,
            }
        }

        fn listing(&self, price: f64) -> Listing {
            Listing {
                marketplace: self.market,
                collection_name: "Plush Pepe".to_string(),
                model_name: "Cozy Galaxy".to_string(),
                model_rarity_pct: 1.5,
                backdrop_name: "Onyx Black".to_string(),
                backdrop_rarity_pct: 2.0,
                price,
                external_id: format!("{}-{price}", self.market),
                raw_status: "listed".to_string(),
                gift_number: None,
            }
        }
    }

    #[async_trait]
    impl MarketClient for FakeMarket {
        fn marketplace(&self) -> Marketplace {
            self.market
        }

        fn page_slots(&self) -> usize {
            1
        }

        async fn fetch_feed_page(&self, _page: u32, _cancel: &CancellationToken) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        fn parse_feed_item(&self, _item: &Value) -> Result<Listing> {
            Err(AppError::MalformedListing("unused".to_string()))
        }

        async fn floor_listings(&self, query: &ListingQuery, _cancel: &CancellationToken) -> Result<Vec<Listing>> {
            if self.fail_on == Some(query.collection.as_str()) || (self.fail_model_only && query.backdrop.is_none()) {
                return Err(AppError::RequestExhausted { attempts: 3, last_error: "HTTP 502".to_string() });
            }
            if self.panic_on == Some(query.collection.as_str()) {
                panic!("upstream returned nonsense");
            }
            let prices = if query.backdrop.is_some() { &self.with_backdrop } else { &self.model_only };
            Ok(prices.iter().map(|p| self.listing(*p)).collect())
        }

        async fn recent_sales(
            &self,
            _query: &ListingQuery,
            _lookback: Duration,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ActivityRecord>> {
            Ok(self
                .sales
                .iter()
                .enumerate()
                .map(|(i, p)| ActivityRecord { price: *p, timestamp: i as f64, kind: "sale".to_string() })
                .collect())
        }

        fn venue(&self, _floor: Option<&Listing>) -> Venue {
            Venue::Portals { attributes: Vec::new() }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        signals: Mutex<Vec<Signal>>,
    }

    #[async_trait]
    impl SignalSink for RecordingSink {
        async fn emit(&self, signal: Signal) {
            self.signals.lock().unwrap().push(signal);
        }
    }

    fn settings() -> EvaluatorSettings {
        EvaluatorSettings {
            dedup_ttl: Duration::from_secs(1800),
            signal_ttl: Duration::from_secs(1800),
            lookback: Duration::from_secs(3 * 86_400),
            cross_market_fee: 0.36,
            min_signal_percent: 0.0,
            filter: SignalFilter::default(),
        }
    }

    fn candidate(collection: &str, key: &str) -> GiftCandidate {
        GiftCandidate {
            marketplace: Marketplace::Tonnel,
            collection_name: collection.to_string(),
            model_name: "Cozy Galaxy".to_string(),
            model_pct: 1.5,
            backdrop_name: "Onyx Black".to_string(),
            backdrop_pct: 2.0,
            price: 80.0,
            gift_number: None,
            dedup_key: key.to_string(),
        }
    }

    struct Harness {
        evaluator: Arc<ArbitrageEvaluator>,
        sink: Arc<RecordingSink>,
        dedup: Arc<DedupCache<String>>,
        health: Arc<HealthState>,
    }

    fn harness(tonnel: FakeMarket, portals: FakeMarket, settings: EvaluatorSettings) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let dedup = Arc::new(DedupCache::new());
        let health = Arc::new(HealthState::new());
        let evaluator = Arc::new(ArbitrageEvaluator::new(
            Arc::new(tonnel),
            Arc::new(portals),
            None,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            Arc::clone(&dedup),
            Arc::clone(&health),
            settings,
        ));
        Harness { evaluator, sink, dedup, health }
    }

    fn default_markets() -> (FakeMarket, FakeMarket) {
        // With backdrop: Tonnel 80/100, Portals 120/130 → TonnelToPortals wins.
        // Model only: Tonnel 80/81, Portals 79/200 → PortalsFloor wins.
        let mut tonnel = FakeMarket::new(Marketplace::Tonnel, &[80.0, 100.0], &[80.0, 81.0]);
        tonnel.sales = vec![10.0, 20.0, 30.0, 40.0, 100.0];
        let portals = FakeMarket::new(Marketplace::Portals, &[120.0, 130.0], &[79.0, 200.0]);
        (tonnel, portals)
    }

    #[tokio::test]
    async fn both_variants_can_emit_their_own_signal() {
        let (tonnel, portals) = default_markets();
        let h = harness(tonnel, portals, settings());

        let n = h.evaluator.evaluate(&candidate("Plush Pepe", "tonnel:1:80"), &CancellationToken::new()).await.unwrap();
        assert_eq!(n, 2);

        let signals = h.sink.signals.lock().unwrap();
        assert_eq!(signals[0].variant, MatchVariant::WithBackdrop);
        assert_eq!(signals[0].direction, Direction::TonnelToPortals);
        let with_fee = signals[0].percent_diff_with_fee.unwrap();
        assert!((with_fee - (120.0 - 80.0 - 0.36) / 120.0 * 100.0).abs() < 1e-9);
        assert_eq!(signals[0].buy_side.marketplace, Marketplace::Tonnel);
        assert_eq!(signals[0].sell_side.marketplace, Marketplace::Portals);
        assert_eq!(signals[0].buy_side.percentile_25, Some(20.0));
        assert_eq!(signals[0].buy_side.activity_level, ActivityLevel::Medium);
        assert_eq!(signals[0].sell_side.percentile_25, None);

        assert_eq!(signals[1].variant, MatchVariant::ModelOnly);
        assert_eq!(signals[1].direction, Direction::PortalsFloor);
        assert!(signals[1].percent_diff_with_fee.is_none());
        assert_eq!(HealthState::get(&h.health.signals_emitted), 2);
    }

    #[tokio::test]
    async fn claimed_key_is_suppressed() {
        let (tonnel, portals) = default_markets();
        let h = harness(tonnel, portals, settings());
        let cancel = CancellationToken::new();
        let c = candidate("Plush Pepe", "tonnel:1:80");

        assert_eq!(h.evaluator.evaluate(&c, &cancel).await.unwrap(), 2);
        assert_eq!(h.evaluator.evaluate(&c, &cancel).await.unwrap(), 0);
        assert_eq!(h.sink.signals.lock().unwrap().len(), 2);
        assert_eq!(HealthState::get(&h.health.candidates_suppressed), 1);
        assert!(h.dedup.contains(&"tonnel:1:80".to_string()));
    }

    #[tokio::test]
    async fn unprofitable_candidate_emits_nothing() {
        // Only the same-market Tonnel comparison is computable, and it is negative.
        let tonnel = FakeMarket::new(Marketplace::Tonnel, &[100.0, 90.0], &[100.0]);
        let portals = FakeMarket::new(Marketplace::Portals, &[], &[]);
        let h = harness(tonnel, portals, settings());

        let n = h.evaluator.evaluate(&candidate("Plush Pepe", "k"), &CancellationToken::new()).await.unwrap();
        assert_eq!(n, 0);
        assert!(h.sink.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn direction_filter_and_threshold_apply() {
        let (tonnel, portals) = default_markets();
        let mut s = settings();
        s.filter.directions = [Direction::PortalsFloor].into_iter().collect();
        let h = harness(tonnel, portals, s);
        let n = h.evaluator.evaluate(&candidate("Plush Pepe", "a"), &CancellationToken::new()).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(h.sink.signals.lock().unwrap()[0].direction, Direction::PortalsFloor);

        let (tonnel, portals) = default_markets();
        let mut s = settings();
        s.min_signal_percent = 50.0;
        let h = harness(tonnel, portals, s);
        let n = h.evaluator.evaluate(&candidate("Plush Pepe", "b"), &CancellationToken::new()).await.unwrap();
        assert_eq!(n, 1, "only the 60.5% model-only signal clears 50%");
    }

    #[tokio::test]
    async fn workers_survive_errors_and_panics() {
        let (mut tonnel, portals) = default_markets();
        tonnel.fail_on = Some("Broken");
        tonnel.panic_on = Some("Cursed");
        let h = harness(tonnel, portals, settings());

        let (tx, rx) = work_queue(8);
        let cancel = CancellationToken::new();
        let handles = Arc::clone(&h.evaluator).spawn_workers(1, rx, cancel.clone());

        tx.push(candidate("Broken", "broken"), &cancel).await.unwrap();
        tx.push(candidate("Cursed", "cursed"), &cancel).await.unwrap();
        tx.push(candidate("Plush Pepe", "good"), &cancel).await.unwrap();

        for _ in 0..200 {
            if h.sink.signals.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.sink.signals.lock().unwrap().len(), 2);
        assert_eq!(HealthState::get(&h.health.evaluation_failures), 2);
        assert!(h.dedup.contains(&"broken".to_string()), "a failed candidate keeps its claim");

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn failure_after_a_partial_emission_does_not_repeat_the_signal() {
        let (mut tonnel, portals) = default_markets();
        tonnel.fail_model_only = true;
        let h = harness(tonnel, portals, settings());

        let (tx, rx) = work_queue(8);
        let cancel = CancellationToken::new();
        let handles = Arc::clone(&h.evaluator).spawn_workers(1, rx, cancel.clone());

        // The same unchanged listing seen by two consecutive scans.
        tx.push(candidate("Plush Pepe", "tonnel:1:80"), &cancel).await.unwrap();
        tx.push(candidate("Plush Pepe", "tonnel:1:80"), &cancel).await.unwrap();

        for _ in 0..200 {
            if HealthState::get(&h.health.candidates_suppressed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(HealthState::get(&h.health.evaluation_failures), 1);
        assert_eq!(HealthState::get(&h.health.candidates_suppressed), 1);
        assert!(h.dedup.contains(&"tonnel:1:80".to_string()));
        let signals = h.sink.signals.lock().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].variant, MatchVariant::WithBackdrop);
        drop(signals);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
