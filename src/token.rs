use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::types::Marketplace;

/// Marketplace session tokens produced by the external auth flow.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn current(&self, market: Marketplace) -> Option<String>;

    /// Wait until a token exists for `market`.
    async fn wait_for(&self, market: Marketplace, cancel: &CancellationToken) -> Result<String>;
}

/// One `watch` cell per marketplace. Seeded from config, refreshed from the token file.
pub struct SharedTokens {
    tonnel: watch::Sender<Option<String>>,
    portals: watch::Sender<Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tonnel: Option<String>,
    #[serde(default)]
    portals: Option<String>,
}

impl SharedTokens {
    pub fn new(tonnel: Option<String>, portals: Option<String>) -> Self {
        Self {
            tonnel: watch::Sender::new(tonnel),
            portals: watch::Sender::new(portals),
        }
    }

    fn cell(&self, market: Marketplace) -> &watch::Sender<Option<String>> {
        match market {
            Marketplace::Tonnel => &self.tonnel,
            Marketplace::Portals => &self.portals,
        }
    }

    /// Replace the token; watchers are only woken when it actually changes.
    pub fn set(&self, market: Marketplace, token: Option<String>) {
        let changed = self.cell(market).send_if_modified(|current| {
            if *current == token {
                false
            } else {
                *current = token.clone();
                true
            }
        });
        if changed {
            info!(%market, present = token.is_some(), "[TOKEN] session token updated");
        }
    }

    /// Apply `{"tonnel": "...", "portals": "..."}`. Absent or empty entries keep the old value.
    pub async fn load_file(&self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: TokenFile = serde_json::from_str(&raw)?;
        for (market, token) in [(Marketplace::Tonnel, file.tonnel), (Marketplace::Portals, file.portals)] {
            if let Some(token) = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
                self.set(market, Some(token));
            }
        }
        Ok(())
    }

    pub async fn run_file_refresher(self: Arc<Self>, path: PathBuf, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.load_file(&path).await {
                        warn!(path = %path.display(), "[TOKEN] token file unreadable: {e}");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TokenProvider for SharedTokens {
    fn current(&self, market: Marketplace) -> Option<String> {
        self.cell(market).borrow().clone()
    }

    async fn wait_for(&self, market: Marketplace, cancel: &CancellationToken) -> Result<String> {
        let mut rx = self.cell(market).subscribe();
        loop {
            if let Some(token) = rx.borrow_and_update().clone() {
                return Ok(token);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                changed = rx.changed() => {
                    changed.map_err(|_| AppError::TokenUnavailable(market.to_string()))?;
                }
            }
        }
    }
}
