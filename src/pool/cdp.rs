//! Minimal Chrome DevTools Protocol client: one WebSocket per browser, commands
//! correlated by id, events routed per attached session.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Upper bound for a single DevTools command, including in-page fetches.
const CALL_TIMEOUT_SECS: u64 = 60;

/// How long a freshly launched browser has to print its DevTools endpoint.
const LAUNCH_TIMEOUT_SECS: u64 = 20;

const DEVTOOLS_BANNER: &str = "DevTools listening on ";

type Pending = DashMap<u64, oneshot::Sender<Result<Value>>>;
type Subscribers = DashMap<String, mpsc::UnboundedSender<CdpEvent>>;

#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

pub struct CdpConnection {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Arc<Pending>,
    /// sessionId → event sink ("" for browser-level events)
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!("[CDP] connected to {ws_url}");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let subscribers: Arc<Subscribers> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("[CDP] write failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        {
            let pending = Arc::clone(&pending);
            let subscribers = Arc::clone(&subscribers);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => dispatch(&text, &pending, &subscribers),
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            warn!("[CDP] read failed: {e}");
                            break;
                        }
                        Ok(_) => {}
                    }
                }
                // Dropping the senders fails every outstanding call instead of leaving it hanging.
                closed.store(true, Ordering::SeqCst);
                pending.clear();
                subscribers.clear();
                info!("[CDP] connection closed");
            });
        }

        Ok(Arc::new(Self {
            outgoing: out_tx,
            pending,
            subscribers,
            next_id: AtomicU64::new(1),
            closed,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one command and wait for its result.
    pub async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        if self.is_closed() {
            return Err(AppError::Browser("devtools connection closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let mut msg = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            msg["sessionId"] = json!(session);
        }
        if self.outgoing.send(msg.to_string()).is_err() || self.is_closed() {
            self.pending.remove(&id);
            return Err(AppError::Browser("devtools connection closed".to_string()));
        }

        match tokio::time::timeout(Duration::from_secs(CALL_TIMEOUT_SECS), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::Browser(format!("{method}: connection closed mid-call"))),
            Err(_) => {
                self.pending.remove(&id);
                Err(AppError::Browser(format!("{method}: timed out")))
            }
        }
    }

    /// Route events for `session_id` to the returned receiver.
    pub fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<CdpEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(session_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, session_id: &str) {
        self.subscribers.remove(session_id);
    }
}

/// Route one incoming frame: command results by id, events by sessionId.
fn dispatch(text: &str, pending: &Pending, subscribers: &Subscribers) {
    let v: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("[CDP] unparsable frame: {e}");
            return;
        }
    };

    if let Some(id) = v.get("id").and_then(Value::as_u64) {
        if let Some((_, tx)) = pending.remove(&id) {
            let result = match v.get("error") {
                Some(err) => Err(AppError::Browser(
                    err.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown devtools error")
                        .to_string(),
                )),
                None => Ok(v.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
        return;
    }

    let Some(method) = v.get("method").and_then(Value::as_str) else {
        return;
    };
    let session = v.get("sessionId").and_then(Value::as_str).unwrap_or("");
    if let Some(sub) = subscribers.get(session) {
        let _ = sub.send(CdpEvent {
            method: method.to_string(),
            params: v.get("params").cloned().unwrap_or(Value::Null),
        });
    }
}

/// Pull a string field out of a command result.
pub fn result_str(result: &Value, field: &str) -> Result<String> {
    result
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Browser(format!("devtools result missing '{field}'")))
}

// ---------------------------------------------------------------------------
// Browser process
// ---------------------------------------------------------------------------

pub struct Browser {
    conn: Arc<CdpConnection>,
    child: Option<Child>,
}

impl Browser {
    /// Launch a headless browser and attach to its DevTools endpoint.
    pub async fn launch(chrome_path: &str) -> Result<Self> {
        let profile_dir = std::env::temp_dir().join(format!("gift-arb-browser-{}", std::process::id()));
        let mut child = Command::new(chrome_path)
            .args([
                "--headless=new",
                "--remote-debugging-port=0",
                "--no-first-run",
                "--no-default-browser-check",
                "--disable-blink-features=AutomationControlled",
                "--disable-dev-shm-usage",
            ])
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Browser("browser stderr unavailable".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();

        let ws_url = tokio::time::timeout(
            Duration::from_secs(LAUNCH_TIMEOUT_SECS),
            read_devtools_url(&mut lines),
        )
        .await
        .map_err(|_| AppError::Browser("browser did not expose DevTools in time".to_string()))??;

        // Keep draining so a chatty browser never blocks on a full pipe.
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

        let conn = CdpConnection::connect(&ws_url).await?;
        Ok(Self { conn, child: Some(child) })
    }

    /// Attach to an already running browser.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        Ok(Self {
            conn: CdpConnection::connect(ws_url).await?,
            child: None,
        })
    }

    pub fn connection(&self) -> Arc<CdpConnection> {
        Arc::clone(&self.conn)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.conn.call("Browser.close", json!({}), None).await {
            debug!("[CDP] Browser.close: {e}");
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("[CDP] browser kill: {e}");
            }
        }
        info!("[CDP] browser closed");
    }
}

async fn read_devtools_url(lines: &mut Lines<BufReader<ChildStderr>>) -> Result<String> {
    while let Some(line) = lines.next_line().await? {
        if let Some(url) = line.trim().strip_prefix(DEVTOOLS_BANNER) {
            return Ok(url.trim().to_string());
        }
    }
    Err(AppError::Browser("browser exited before exposing DevTools".to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_are_routed_by_id() {
        let pending: Pending = DashMap::new();
        let subscribers: Subscribers = DashMap::new();
        let (tx, rx) = oneshot::channel();
        pending.insert(7, tx);

        dispatch(r#"{"id":7,"result":{"targetId":"T1"}}"#, &pending, &subscribers);

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result_str(&result, "targetId").unwrap(), "T1");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn protocol_errors_become_browser_errors() {
        let pending: Pending = DashMap::new();
        let subscribers: Subscribers = DashMap::new();
        let (tx, rx) = oneshot::channel();
        pending.insert(1, tx);

        dispatch(r#"{"id":1,"error":{"code":-32000,"message":"No target"}}"#, &pending, &subscribers);

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(AppError::Browser(m)) if m == "No target"));
    }

    #[test]
    fn events_go_to_the_matching_session_only() {
        let pending: Pending = DashMap::new();
        let subscribers: Subscribers = DashMap::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        subscribers.insert("A".to_string(), tx_a);
        subscribers.insert("B".to_string(), tx_b);

        dispatch(
            r#"{"method":"Runtime.consoleAPICalled","sessionId":"B","params":{"type":"log"}}"#,
            &pending,
            &subscribers,
        );

        assert!(rx_a.try_recv().is_err());
        let ev = rx_b.try_recv().unwrap();
        assert_eq!(ev.method, "Runtime.consoleAPICalled");
        assert_eq!(ev.params["type"], "log");
    }

    #[test]
    fn missing_result_field_is_an_error() {
        assert!(result_str(&json!({}), "sessionId").is_err());
    }
}
