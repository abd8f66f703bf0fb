pub mod dedup_cache;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use dedup_cache::DedupCache;

/// Periodically purge expired entries so long-running caches stay bounded.
pub async fn run_sweeper(cache: Arc<DedupCache<String>>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let dropped = cache.purge_expired();
                if dropped > 0 {
                    debug!(dropped, remaining = cache.len(), "[CACHE] purged expired dedup keys");
                }
            }
        }
    }
}
