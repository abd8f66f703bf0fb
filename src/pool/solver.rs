use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SOLVER_POLL_SECS;
use crate::error::{AppError, Result};

/// Parameters captured from the challenge widget's render call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeParams {
    pub sitekey: String,
    pub pageurl: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub pagedata: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub useragent: Option<String>,
}

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Resolve a token for the captured challenge, or fail. Must stop on cancellation.
    async fn solve(&self, params: &ChallengeParams, cancel: &CancellationToken) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Two-phase solver API client
// ---------------------------------------------------------------------------

const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Debug, Deserialize)]
struct SolverReply {
    status: i64,
    request: String,
}

#[derive(Debug, Serialize)]
struct CreateTask<'a> {
    key: &'a str,
    method: &'a str,
    sitekey: &'a str,
    pageurl: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pagedata: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    useragent: Option<&'a str>,
    json: u8,
}

/// create-task (`in.php`) then poll-result (`res.php`) every `poll` until the token
/// arrives, the service reports a failure, or the caller cancels.
pub struct TwoCaptchaSolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll: Duration,
}

impl TwoCaptchaSolver {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            poll: Duration::from_secs(SOLVER_POLL_SECS),
        })
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    #[cfg(test)]
    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    async fn create_task(&self, params: &ChallengeParams) -> Result<String> {
        let body = CreateTask {
            key: &self.api_key,
            method: "turnstile",
            sitekey: &params.sitekey,
            pageurl: &params.pageurl,
            data: params.data.as_deref(),
            pagedata: params.pagedata.as_deref(),
            action: params.action.as_deref(),
            useragent: params.useragent.as_deref(),
            json: 1,
        };
        let reply: SolverReply = self
            .http
            .post(format!("{}/in.php", self.base_url))
            .form(&body)
            .send()
            .await?
            .json()
            .await?;
        if reply.status == 1 {
            Ok(reply.request)
        } else {
            Err(AppError::Challenge(format!("create-task rejected: {}", reply.request)))
        }
    }

    /// `Ok(None)` while the task is still being worked on.
    async fn poll_result(&self, task_id: &str) -> Result<Option<String>> {
        let reply: SolverReply = self
            .http
            .get(format!("{}/res.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;
        match (reply.status, reply.request.as_str()) {
            (1, _) => Ok(Some(reply.request)),
            (_, NOT_READY) => Ok(None),
            (_, other) => Err(AppError::Challenge(format!("task {task_id} failed: {other}"))),
        }
    }
}

#[async_trait]
impl ChallengeSolver for TwoCaptchaSolver {
    async fn solve(&self, params: &ChallengeParams, cancel: &CancellationToken) -> Result<String> {
        let task_id = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = self.create_task(params) => r?,
        };
        info!(task_id = %task_id, pageurl = %params.pageurl, "[SOLVER] task created");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task_id = %task_id, "[SOLVER] cancelled, discarding task");
                    return Err(AppError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll) => {}
            }
            if let Some(token) = self.poll_result(&task_id).await? {
                info!(task_id = %task_id, "[SOLVER] task solved");
                return Ok(token);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Solver task
// ---------------------------------------------------------------------------

/// One solve request. The answer goes back on `reply`.
pub struct SolveJob {
    pub slot: usize,
    pub params: ChallengeParams,
    pub reply: oneshot::Sender<Result<String>>,
}

/// Dedicated task consuming solve jobs. Each job runs concurrently so one slow
/// challenge never delays another slot. A job is abandoned as soon as its requester
/// stops waiting for the answer.
pub async fn run_solver_task(
    solver: Arc<dyn ChallengeSolver>,
    mut jobs: mpsc::Receiver<SolveJob>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => job,
        };
        let Some(job) = job else { break };

        let solver = Arc::clone(&solver);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let SolveJob { slot, params, mut reply } = job;
            let result = tokio::select! {
                r = solver.solve(&params, &cancel) => r,
                _ = reply.closed() => {
                    debug!(slot, "[SOLVER] requester gave up, solve abandoned");
                    return;
                }
            };
            if let Err(e) = &result {
                warn!(slot, "[SOLVER] solve failed: {e}");
            }
            if reply.send(result).is_err() {
                debug!(slot, "[SOLVER] requester gone before the answer arrived");
            }
        });
    }
    info!("[SOLVER] solver task stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
