use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::latency::LatencyStats;
use crate::config::{
    ACQUIRE_POLL_MS, BLOCKED_COOLDOWN_SECS, BROWSED_COOLDOWN_MS, BROWSED_MAX_ATTEMPTS,
    CHALLENGE_TIMEOUT_SECS,
};
use crate::error::{AppError, Result};
use crate::pool::cdp::Browser;
use crate::pool::gate::SlotGate;
use crate::pool::proxy::ProxyConfig;
use crate::pool::session::{CdpPageSession, Interception, PageSession};
use crate::pool::solver::{ChallengeParams, SolveJob};

/// Interceptions buffered between page event pumps and the challenge loop.
const INTERCEPTION_CAPACITY: usize = 64;

/// Longest upstream body kept in an `UpstreamStatus` error.
const ERROR_BODY_LIMIT: usize = 200;

/// Persistent browser pages, one per proxy, for marketplaces that reject plain clients.
pub struct BrowsedPool {
    name: String,
    sessions: Vec<Arc<dyn PageSession>>,
    gate: SlotGate,
    closed: AtomicBool,
    latency: Arc<LatencyStats>,
    max_attempts: usize,
    cooldown: Duration,
    blocked_cooldown: Duration,
    challenge_timeout: Duration,
    browser: Mutex<Option<Browser>>,
}

impl BrowsedPool {
    /// Open one page per proxy in `browser`. Sessions that fail to open are skipped;
    /// none left is fatal. The receiver feeds `run_challenge_loop`.
    pub async fn launch(
        name: &str,
        browser: Browser,
        proxies: &[ProxyConfig],
        origin: &str,
        latency: Arc<LatencyStats>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Interception>)> {
        let conn = browser.connection();
        let (tx, rx) = mpsc::channel(INTERCEPTION_CAPACITY);

        let mut sessions: Vec<Arc<dyn PageSession>> = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            let slot = sessions.len();
            match CdpPageSession::open(Arc::clone(&conn), slot, proxy, origin, tx.clone()).await {
                Ok(session) => sessions.push(Arc::new(session)),
                Err(e) => warn!(proxy = %proxy.label(), "[POOL] {name}: browser session failed: {e}"),
            }
        }

        if sessions.is_empty() {
            browser.close().await;
            return Err(AppError::NoProxies(format!("{name} pool opened no browser sessions")));
        }

        let pool = Self::from_sessions(name, sessions, latency);
        *pool.browser.lock().await = Some(browser);
        Ok((Arc::new(pool), rx))
    }

    pub fn from_sessions(name: &str, sessions: Vec<Arc<dyn PageSession>>, latency: Arc<LatencyStats>) -> Self {
        info!("[POOL] {name}: {} browser slots ready", sessions.len());
        Self {
            name: name.to_string(),
            gate: SlotGate::new(sessions.len(), Duration::from_millis(ACQUIRE_POLL_MS)),
            sessions,
            closed: AtomicBool::new(false),
            latency,
            max_attempts: BROWSED_MAX_ATTEMPTS,
            cooldown: Duration::from_millis(BROWSED_COOLDOWN_MS),
            blocked_cooldown: Duration::from_secs(BLOCKED_COOLDOWN_SECS),
            challenge_timeout: Duration::from_secs(CHALLENGE_TIMEOUT_SECS),
            browser: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_cooldowns(mut self, per_request: Duration, after_block: Duration) -> Self {
        self.cooldown = per_request;
        self.blocked_cooldown = after_block;
        self
    }

    #[cfg(test)]
    pub fn with_challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn busy_count(&self) -> usize {
        self.gate.busy_count()
    }

    pub fn suspended_count(&self) -> usize {
        self.gate.suspended_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// JSON `POST` from inside a pooled page. 403 cools the slot, reloads its page and
    /// retries elsewhere; any other non-200 status is returned as an error.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let mut tried: Vec<usize> = Vec::with_capacity(self.max_attempts);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            if self.is_closed() {
                return Err(AppError::PoolClosed);
            }
            let lease = self.gate.acquire(&tried, self.cooldown, cancel).await?;
            let index = lease.index();
            tried.push(index);
            let session = &self.sessions[index];

            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                r = session.fetch(url, body) => r,
            };
            self.latency.record(started.elapsed());

            match result {
                Ok(resp) if resp.status == 200 => {
                    debug!(pool = %self.name, slot = %session.label(), attempt, "[POOL] request ok");
                    return Ok(serde_json::from_str(&resp.text)?);
                }
                Ok(resp) if resp.status == 403 => {
                    warn!(pool = %self.name, slot = %session.label(), attempt, "[POOL] blocked (403), reloading slot");
                    self.gate.cool_down(index, self.blocked_cooldown);
                    if let Err(e) = session.reload().await {
                        warn!(pool = %self.name, slot = %session.label(), "[POOL] reload failed: {e}");
                    }
                    last_error = "HTTP 403".to_string();
                }
                Ok(resp) => {
                    return Err(AppError::UpstreamStatus {
                        status: resp.status,
                        body: resp.text.chars().take(ERROR_BODY_LIMIT).collect(),
                    });
                }
                Err(AppError::PoolClosed) => return Err(AppError::PoolClosed),
                Err(e) => {
                    warn!(pool = %self.name, slot = %session.label(), attempt, "[POOL] page fetch failed: {e}");
                    last_error = e.to_string();
                }
            }
        }

        Err(AppError::RequestExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Consume intercepted challenges: suspend the slot, hand the parameters to the
    /// solver task, inject the token, resume the slot whatever the outcome.
    pub async fn run_challenge_loop(
        self: Arc<Self>,
        mut interceptions: mpsc::Receiver<Interception>,
        solver_jobs: mpsc::Sender<SolveJob>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                i = interceptions.recv() => i,
            };
            let Some(Interception { slot, params }) = next else { break };

            if slot >= self.sessions.len() {
                warn!(pool = %self.name, slot, "[POOL] interception for unknown slot");
                continue;
            }
            if self.gate.is_suspended(slot) {
                debug!(pool = %self.name, slot, "[POOL] challenge already in progress");
                continue;
            }
            self.gate.suspend(slot);

            let pool = Arc::clone(&self);
            let solver_jobs = solver_jobs.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let label = pool.sessions[slot].label().to_string();
                match pool.clear_challenge(slot, params, &solver_jobs, &cancel).await {
                    Ok(()) => info!(pool = %pool.name, slot = %label, "[POOL] challenge cleared"),
                    Err(e) => warn!(pool = %pool.name, slot = %label, "[POOL] challenge not cleared: {e}"),
                }
                pool.gate.resume(slot);
            });
        }
        info!(pool = %self.name, "[POOL] challenge loop stopped");
    }

    async fn clear_challenge(
        &self,
        slot: usize,
        params: ChallengeParams,
        solver_jobs: &mpsc::Sender<SolveJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        solver_jobs
            .send(SolveJob { slot, params, reply })
            .await
            .map_err(|_| AppError::ChannelSend("solver task is gone".to_string()))?;

        let token = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = tokio::time::timeout(self.challenge_timeout, answer) => match r {
                Err(_) => return Err(AppError::Challenge("timed out waiting for token".to_string())),
                Ok(Err(_)) => return Err(AppError::Challenge("solver dropped the request".to_string())),
                Ok(Ok(result)) => result?,
            },
        };
        self.sessions[slot].submit_token(&token).await
    }

    /// Refuse new calls, close every page, then the browser.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for session in &self.sessions {
            if let Err(e) = session.close().await {
                debug!(pool = %self.name, slot = %session.label(), "[POOL] session close: {e}");
            }
        }
        if let Some(browser) = self.browser.lock().await.take() {
            browser.close().await;
        }
        info!(pool = %self.name, "[POOL] shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::session::PageResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct FakeSession {
        label: String,
        script: std::sync::Mutex<VecDeque<Result<PageResponse>>>,
        fallback_status: u16,
        fetches: AtomicUsize,
        reloads: AtomicUsize,
        tokens: std::sync::Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl FakeSession {
        fn new(label: &str, fallback_status: u16) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                script: std::sync::Mutex::new(VecDeque::new()),
                fallback_status,
                fetches: AtomicUsize::new(0),
                reloads: AtomicUsize::new(0),
                tokens: std::sync::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn push(&self, r: Result<PageResponse>) {
            self.script.lock().unwrap().push_back(r);
        }
    }

    #[async_trait]
    impl PageSession for FakeSession {
        fn label(&self) -> &str {
            &self.label
        }

        async fn fetch(&self, _url: &str, _body: &Value) -> Result<PageResponse> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(AppError::PoolClosed);
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(PageResponse {
                    status: self.fallback_status,
                    text: r#"{"ok":true}"#.to_string(),
                })
            })
        }

        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn submit_token(&self, token: &str) -> Result<()> {
            self.tokens.lock().unwrap().push(token.to_string());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool_of(sessions: &[Arc<FakeSession>]) -> Arc<BrowsedPool> {
        let sessions: Vec<Arc<dyn PageSession>> = sessions
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn PageSession>)
            .collect();
        Arc::new(
            BrowsedPool::from_sessions("test", sessions, Arc::new(LatencyStats::new()))
                .with_cooldowns(Duration::ZERO, Duration::from_secs(60))
                .with_challenge_timeout(Duration::from_secs(2)),
        )
    }

    fn params() -> ChallengeParams {
        ChallengeParams {
            sitekey: "0x4A".to_string(),
            pageurl: "https://market.example/".to_string(),
            data: None,
            pagedata: None,
            action: None,
            useragent: None,
        }
    }

    #[tokio::test]
    async fn blocked_slot_is_reloaded_and_request_moves_on() {
        let a = FakeSession::new("a", 403);
        let b = FakeSession::new("b", 200);
        let pool = pool_of(&[Arc::clone(&a), Arc::clone(&b)]);

        let v: Value = pool
            .post_json("https://api/pageGifts", &serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(a.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(b.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(pool.busy_count(), 0);

        // Slot a is still cooling from the 403, so the next request lands on b.
        let _: Value = pool
            .post_json("https://api/pageGifts", &serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(a.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(b.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_errors_exhaust_the_budget() {
        let a = FakeSession::new("a", 200);
        let b = FakeSession::new("b", 200);
        for _ in 0..3 {
            a.push(Err(AppError::Browser("net::ERR_PROXY".to_string())));
            b.push(Err(AppError::Browser("net::ERR_PROXY".to_string())));
        }
        let pool = pool_of(&[Arc::clone(&a), Arc::clone(&b)]);

        let r: Result<Value> = pool
            .post_json("https://api/x", &serde_json::json!({}), &CancellationToken::new())
            .await;
        match r {
            Err(AppError::RequestExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("ERR_PROXY"));
            }
            other => panic!("expected RequestExhausted, got {other:?}"),
        }
        assert_eq!(a.fetches.load(Ordering::SeqCst) + b.fetches.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn other_statuses_are_not_retried() {
        let a = FakeSession::new("a", 500);
        let b = FakeSession::new("b", 200);
        let pool = pool_of(&[Arc::clone(&a), Arc::clone(&b)]);

        let r: Result<Value> = pool
            .post_json("https://api/x", &serde_json::json!({}), &CancellationToken::new())
            .await;
        assert!(matches!(r, Err(AppError::UpstreamStatus { status: 500, .. })));
        assert_eq!(b.fetches.load(Ordering::SeqCst), 0);
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn challenge_suspends_slot_until_token_is_injected() {
        let a = FakeSession::new("a", 200);
        let pool = pool_of(&[Arc::clone(&a)]);
        let (int_tx, int_rx) = mpsc::channel(4);
        let (job_tx, mut job_rx) = mpsc::channel::<SolveJob>(4);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&pool).run_challenge_loop(int_rx, job_tx, cancel.clone()));

        int_tx.send(Interception { slot: 0, params: params() }).await.unwrap();
        let job = job_rx.recv().await.unwrap();
        assert_eq!(job.slot, 0);
        assert_eq!(job.params.sitekey, "0x4A");
        assert_eq!(pool.suspended_count(), 1);

        job.reply.send(Ok("TOKEN".to_string())).unwrap();
        wait_until(|| pool.suspended_count() == 0).await;
        assert_eq!(*a.tokens.lock().unwrap(), vec!["TOKEN".to_string()]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_solve_still_resumes_the_slot() {
        let a = FakeSession::new("a", 200);
        let pool = pool_of(&[Arc::clone(&a)]);
        let (int_tx, int_rx) = mpsc::channel(4);
        let (job_tx, mut job_rx) = mpsc::channel::<SolveJob>(4);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&pool).run_challenge_loop(int_rx, job_tx, cancel.clone()));

        int_tx.send(Interception { slot: 0, params: params() }).await.unwrap();
        let job = job_rx.recv().await.unwrap();
        job.reply
            .send(Err(AppError::Challenge("ERROR_CAPTCHA_UNSOLVABLE".to_string())))
            .unwrap();

        wait_until(|| pool.suspended_count() == 0).await;
        assert!(a.tokens.lock().unwrap().is_empty());

        // The resumed slot serves requests again.
        let v: Value = pool
            .post_json("https://api/x", &serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v["ok"], true);
        cancel.cancel();
    }

    #[tokio::test]
    async fn closed_pool_refuses_requests() {
        let a = FakeSession::new("a", 200);
        let pool = pool_of(&[Arc::clone(&a)]);
        pool.shutdown().await;

        assert!(a.closed.load(Ordering::SeqCst));
        let r: Result<Value> = pool
            .post_json("https://api/x", &serde_json::json!({}), &CancellationToken::new())
            .await;
        assert!(matches!(r, Err(AppError::PoolClosed)));
    }
}
