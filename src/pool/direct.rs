use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::latency::LatencyStats;
use crate::config::{ACQUIRE_POLL_MS, DIRECT_COOLDOWN_MS, DIRECT_MAX_ATTEMPTS};
use crate::error::{AppError, Result};
use crate::pool::gate::SlotGate;
use crate::pool::proxy::ProxyConfig;

struct DirectSlot {
    label: String,
    client: reqwest::Client,
}

/// Proxy-bound HTTP clients behind a cooldown-gated, round-robin gate.
pub struct DirectPool {
    name: String,
    slots: Vec<DirectSlot>,
    gate: SlotGate,
    /// Inclusive per-acquisition cooldown range in milliseconds.
    cooldown_ms: (u64, u64),
    max_attempts: usize,
    latency: Arc<LatencyStats>,
}

impl DirectPool {
    /// One client per proxy. Proxies that fail to build are skipped; none left is fatal.
    pub fn from_proxies(name: &str, proxies: &[ProxyConfig], latency: Arc<LatencyStats>) -> Result<Self> {
        let mut clients = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            let built = proxy.to_reqwest().and_then(|p| {
                reqwest::Client::builder()
                    .proxy(p)
                    .timeout(Duration::from_secs(30))
                    .build()
                    .map_err(AppError::from)
            });
            match built {
                Ok(client) => clients.push((proxy.label(), client)),
                Err(e) => warn!(proxy = %proxy.label(), "[POOL] {name}: skipping proxy: {e}"),
            }
        }
        Self::from_clients(name, clients, latency)
    }

    pub fn from_clients(
        name: &str,
        clients: Vec<(String, reqwest::Client)>,
        latency: Arc<LatencyStats>,
    ) -> Result<Self> {
        if clients.is_empty() {
            return Err(AppError::NoProxies(format!("{name} pool has no usable clients")));
        }
        let slots: Vec<DirectSlot> = clients
            .into_iter()
            .map(|(label, client)| DirectSlot { label, client })
            .collect();
        info!("[POOL] {name}: {} direct slots ready", slots.len());
        Ok(Self {
            name: name.to_string(),
            gate: SlotGate::new(slots.len(), Duration::from_millis(ACQUIRE_POLL_MS)),
            slots,
            cooldown_ms: DIRECT_COOLDOWN_MS,
            max_attempts: DIRECT_MAX_ATTEMPTS,
            latency,
        })
    }

    #[cfg(test)]
    pub fn with_cooldown_ms(mut self, min: u64, max: u64) -> Self {
        self.cooldown_ms = (min.min(max), min.max(max));
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn busy_count(&self) -> usize {
        self.gate.busy_count()
    }

    fn next_cooldown(&self) -> Duration {
        let (min, max) = self.cooldown_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Send a request built fresh for each attempt, on distinct slots where possible.
    /// Non-success statuses and transport errors are retried; the budget ends in
    /// `RequestExhausted`.
    pub async fn send<F>(&self, build: F, cancel: &CancellationToken) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut tried: Vec<usize> = Vec::with_capacity(self.max_attempts);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            let lease = self.gate.acquire(&tried, self.next_cooldown(), cancel).await?;
            let slot = &self.slots[lease.index()];
            tried.push(lease.index());

            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                r = build(&slot.client).send() => r,
            };
            self.latency.record(started.elapsed());
            drop(lease);

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(pool = %self.name, slot = %slot.label, attempt, "[POOL] request ok");
                    return Ok(resp);
                }
                Ok(resp) => {
                    last_error = format!("HTTP {}", resp.status());
                    warn!(pool = %self.name, slot = %slot.label, attempt, "[POOL] non-success response: {last_error}");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(pool = %self.name, slot = %slot.label, attempt, "[POOL] transport error: {e}");
                }
            }
        }

        Err(AppError::RequestExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let resp = self
            .send(
                |client| {
                    headers
                        .iter()
                        .fold(client.get(url), |req, (k, v)| req.header(*k, v.as_str()))
                },
                cancel,
            )
            .await?;
        Ok(resp.json::<T>().await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
