use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::pool::cdp::{result_str, CdpConnection, CdpEvent};
use crate::pool::proxy::ProxyConfig;
use crate::pool::solver::ChallengeParams;

/// Console prefix the injected script uses to report a captured challenge.
pub const INTERCEPT_PREFIX: &str = "intercepted-params:";

/// Runs before any page script. Replaces the challenge widget's `render` so its
/// parameters are reported on the console and its callback is kept on `window`.
pub const INTERCEPT_SCRIPT: &str = r#"(() => {
  const hook = () => {
    if (!window.turnstile || window.turnstile.__hooked) return false;
    window.turnstile.render = (container, options) => {
      const params = {
        sitekey: options.sitekey,
        pageurl: window.location.href,
        data: options.cData || null,
        pagedata: options.chlPageData || null,
        action: options.action || null,
        useragent: navigator.userAgent,
      };
      window.tsCallback = options.callback;
      console.log("intercepted-params:" + JSON.stringify(params));
      return "intercepted";
    };
    window.turnstile.__hooked = true;
    return true;
  };
  const timer = setInterval(() => { if (hook()) clearInterval(timer); }, 50);
})();"#;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageResponse {
    pub status: u16,
    pub text: String,
}

/// A challenge captured on one slot's page.
#[derive(Debug, Clone)]
pub struct Interception {
    pub slot: usize,
    pub params: ChallengeParams,
}

/// One persistent page bound to one proxy.
#[async_trait]
pub trait PageSession: Send + Sync {
    fn label(&self) -> &str;

    /// JSON `POST` issued from inside the page, so it carries the page's cookies.
    async fn fetch(&self, url: &str, body: &Value) -> Result<PageResponse>;

    async fn reload(&self) -> Result<()>;

    /// Hand a solved challenge token to the widget callback stored by the hook.
    async fn submit_token(&self, token: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DevTools-backed session
// ---------------------------------------------------------------------------

pub struct CdpPageSession {
    label: String,
    conn: Arc<CdpConnection>,
    context_id: String,
    target_id: String,
    session_id: String,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CdpPageSession {
    /// Isolated context through `proxy`, hook installed, page navigated to `origin`.
    pub async fn open(
        conn: Arc<CdpConnection>,
        slot: usize,
        proxy: &ProxyConfig,
        origin: &str,
        interceptions: mpsc::Sender<Interception>,
    ) -> Result<Self> {
        let ctx = conn
            .call(
                "Target.createBrowserContext",
                json!({ "proxyServer": proxy.server_url(), "disposeOnDetach": true }),
                None,
            )
            .await?;
        let context_id = result_str(&ctx, "browserContextId")?;

        let target = conn
            .call(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": context_id }),
                None,
            )
            .await?;
        let target_id = result_str(&target, "targetId")?;

        let attached = conn
            .call("Target.attachToTarget", json!({ "targetId": target_id, "flatten": true }), None)
            .await?;
        let session_id = result_str(&attached, "sessionId")?;

        let events = conn.subscribe(&session_id);
        let sid = Some(session_id.as_str());
        conn.call("Page.enable", json!({}), sid).await?;
        conn.call("Runtime.enable", json!({}), sid).await?;
        conn.call(
            "Fetch.enable",
            json!({ "handleAuthRequests": true, "patterns": [{ "urlPattern": "*" }] }),
            sid,
        )
        .await?;
        conn.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": INTERCEPT_SCRIPT }),
            sid,
        )
        .await?;

        let pump = tokio::spawn(pump_events(
            Arc::clone(&conn),
            session_id.clone(),
            slot,
            proxy.clone(),
            events,
            interceptions,
        ));

        conn.call("Page.navigate", json!({ "url": origin }), sid).await?;
        info!(slot, proxy = %proxy.label(), "[POOL] browser session ready");

        Ok(Self {
            label: proxy.label(),
            conn,
            context_id,
            target_id,
            session_id,
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::PoolClosed);
        }
        let result = self
            .conn
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "awaitPromise": true, "returnByValue": true }),
                Some(&self.session_id),
            )
            .await?;
        evaluated_value(result)
    }
}

#[async_trait]
impl PageSession for CdpPageSession {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self, url: &str, body: &Value) -> Result<PageResponse> {
        let value = self.evaluate(&fetch_expression(url, body)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn reload(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::PoolClosed);
        }
        self.conn
            .call("Page.reload", json!({ "ignoreCache": true }), Some(&self.session_id))
            .await?;
        Ok(())
    }

    async fn submit_token(&self, token: &str) -> Result<()> {
        let delivered = self.evaluate(&callback_expression(token)?).await?;
        if delivered.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(AppError::Challenge("page has no stored widget callback".to_string()))
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(pump) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pump.abort();
        }
        self.conn.unsubscribe(&self.session_id);
        self.conn
            .call("Target.closeTarget", json!({ "targetId": self.target_id }), None)
            .await?;
        self.conn
            .call(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
                None,
            )
            .await?;
        debug!(slot = %self.label, "[POOL] browser session closed");
        Ok(())
    }
}

/// Answers interception and auth events for one page and reports captured challenges.
async fn pump_events(
    conn: Arc<CdpConnection>,
    session_id: String,
    slot: usize,
    proxy: ProxyConfig,
    mut events: mpsc::UnboundedReceiver<CdpEvent>,
    interceptions: mpsc::Sender<Interception>,
) {
    while let Some(event) = events.recv().await {
        match event.method.as_str() {
            "Fetch.requestPaused" => {
                let Some(request_id) = event.params.get("requestId").cloned() else { continue };
                let conn = Arc::clone(&conn);
                let sid = session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = conn
                        .call("Fetch.continueRequest", json!({ "requestId": request_id }), Some(&sid))
                        .await
                    {
                        debug!("[POOL] continueRequest: {e}");
                    }
                });
            }
            "Fetch.authRequired" => {
                let Some(request_id) = event.params.get("requestId").cloned() else { continue };
                let conn = Arc::clone(&conn);
                let sid = session_id.clone();
                let params = json!({
                    "requestId": request_id,
                    "authChallengeResponse": {
                        "response": "ProvideCredentials",
                        "username": proxy.username,
                        "password": proxy.password,
                    },
                });
                tokio::spawn(async move {
                    if let Err(e) = conn.call("Fetch.continueWithAuth", params, Some(&sid)).await {
                        warn!("[POOL] proxy auth reply failed: {e}");
                    }
                });
            }
            "Runtime.consoleAPICalled" => {
                if let Some(params) = parse_console_interception(&event.params) {
                    info!(slot, sitekey = %params.sitekey, "[POOL] challenge intercepted");
                    if interceptions.send(Interception { slot, params }).await.is_err() {
                        debug!(slot, "[POOL] challenge loop gone, dropping interception");
                    }
                }
            }
            _ => {}
        }
    }
}

/// Extract captured challenge parameters from a `Runtime.consoleAPICalled` payload.
pub fn parse_console_interception(params: &Value) -> Option<ChallengeParams> {
    let first = params.get("args")?.as_array()?.first()?;
    let text = first.get("value")?.as_str()?;
    let payload = text.strip_prefix(INTERCEPT_PREFIX)?;
    match serde_json::from_str(payload) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("[POOL] unreadable challenge parameters: {e}");
            None
        }
    }
}

/// In-page fetch returning `{status, text}`. Inputs are embedded as JSON literals.
pub fn fetch_expression(url: &str, body: &Value) -> Result<String> {
    let url = serde_json::to_string(url)?;
    let body = serde_json::to_string(&body.to_string())?;
    Ok(format!(
        r#"(async () => {{
  const r = await fetch({url}, {{
    method: "POST",
    headers: {{ "Content-Type": "application/json" }},
    body: {body},
    credentials: "include",
  }});
  return {{ status: r.status, text: await r.text() }};
}})()"#
    ))
}

fn callback_expression(token: &str) -> Result<String> {
    let token = serde_json::to_string(token)?;
    Ok(format!(
        r#"(() => {{
  if (typeof window.tsCallback !== "function") return false;
  window.tsCallback({token});
  return true;
}})()"#
    ))
}

/// Unwrap a `Runtime.evaluate` result, surfacing page exceptions as errors.
fn evaluated_value(result: Value) -> Result<Value> {
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("page script threw");
        return Err(AppError::Browser(text.to_string()));
    }
    Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_interception_is_parsed() {
        let params = json!({
            "type": "log",
            "args": [{
                "type": "string",
                "value": "intercepted-params:{\"sitekey\":\"0x4A\",\"pageurl\":\"https://m/\",\"data\":null,\"pagedata\":null,\"action\":\"a\",\"useragent\":\"UA\"}"
            }]
        });
        let p = parse_console_interception(&params).unwrap();
        assert_eq!(p.sitekey, "0x4A");
        assert_eq!(p.pageurl, "https://m/");
        assert_eq!(p.data, None);
        assert_eq!(p.action.as_deref(), Some("a"));
    }

    #[test]
    fn unrelated_console_lines_are_ignored() {
        let params = json!({ "type": "log", "args": [{ "type": "string", "value": "hello" }] });
        assert!(parse_console_interception(&params).is_none());
        assert!(parse_console_interception(&json!({ "args": [] })).is_none());
    }

    #[test]
    fn fetch_expression_escapes_inputs() {
        let expr = fetch_expression("https://api/x\"y", &json!({ "a": "</script>" })).unwrap();
        assert!(expr.contains(r#"fetch("https://api/x\"y""#));
        assert!(expr.contains(r#"body: "{\"a\":\"</script>\"}""#));
    }

    #[test]
    fn evaluate_result_unwraps_value() {
        let v = evaluated_value(json!({ "result": { "type": "object", "value": { "status": 403, "text": "" } } }))
            .unwrap();
        let resp: PageResponse = serde_json::from_value(v).unwrap();
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn evaluate_exception_is_an_error() {
        let r = evaluated_value(json!({
            "result": { "type": "object" },
            "exceptionDetails": { "text": "Uncaught", "exception": { "description": "TypeError: Failed to fetch" } }
        }));
        assert!(matches!(r, Err(AppError::Browser(m)) if m.contains("Failed to fetch")));
    }
}
