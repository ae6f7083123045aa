//! Raw CDP transport: one WebSocket per page target, flat-session routed for attached
//! out-of-process iframe targets.
//!
//! Command/response correlation is a numeric `id` mapped to a one-shot channel, exactly the
//! shape used throughout the codebase this grew from. Events differ: instead of one-shot
//! per-method subscribers (fine for a client that only ever awaits one event at a time),
//! this fans every event out on a `tokio::broadcast` channel so the quiescence detector can
//! run an arbitrary number of concurrent, independent waiters over the same stream.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{Result, ServiceError};

/// A CDP event, scoped to the flat-session it was received on (`None` = the root page session).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// One WebSocket connection to a single page's devtools endpoint.
pub struct CdpConnection {
    tx: Arc<Mutex<WsSink>>,
    responses: Arc<Mutex<HashMap<u32, oneshot::Sender<Value>>>>,
    events: broadcast::Sender<CdpEvent>,
    msg_id: AtomicU32,
}

impl CdpConnection {
    /// Connect to a page's `webSocketDebuggerUrl` and start the background reader task.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| ServiceError::DriverGone(format!("cdp websocket connect failed: {e}")))?;
        let (tx, mut rx) = stream.split();

        let responses: Arc<Mutex<HashMap<u32, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _) = broadcast::channel::<CdpEvent>(1024);

        let responses_reader = responses.clone();
        let event_tx_reader = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(t)) => t,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                };
                let Ok(json) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if let Some(id) = json.get("id").and_then(|v| v.as_u64()) {
                    if let Some(sender) = responses_reader.lock().await.remove(&(id as u32)) {
                        let _ = sender.send(json);
                    }
                    continue;
                }
                if let Some(method) = json.get("method").and_then(|v| v.as_str()) {
                    let session_id = json
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    let params = json.get("params").cloned().unwrap_or(Value::Null);
                    let _ = event_tx_reader.send(CdpEvent {
                        session_id,
                        method: method.to_string(),
                        params,
                    });
                }
            }
            tracing::debug!("cdp connection reader exited");
        });

        Ok(Self {
            tx: Arc::new(Mutex::new(tx)),
            responses,
            events: event_tx,
            msg_id: AtomicU32::new(1),
        })
    }

    /// Subscribe to the full event stream. Cheap: broadcast receivers are independent.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Send a command on the root session (the page's own target) and await its response.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.send_in_session(method, params, None).await
    }

    /// Send a command, optionally flat-routed into an attached target's `sessionId`.
    pub async fn send_in_session(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let id = self.msg_id.fetch_add(1, Ordering::SeqCst);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.responses.lock().await.insert(id, resp_tx);

        let mut command = json!({ "id": id, "method": method, "params": params });
        if let Some(sid) = session_id {
            command["sessionId"] = json!(sid);
        }

        {
            let mut tx = self.tx.lock().await;
            tx.send(WsMessage::Text(command.to_string()))
                .await
                .map_err(|e| ServiceError::DriverGone(format!("cdp send failed: {e}")))?;
        }

        let response = tokio::time::timeout(std::time::Duration::from_secs(30), resp_rx)
            .await
            .map_err(|_| ServiceError::Timeout(format!("cdp command {method} timed out")))?
            .map_err(|_| ServiceError::DriverGone("cdp response channel closed".to_string()))?;

        if let Some(err) = response.get("error") {
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown cdp error");
            return Err(ServiceError::Internal(format!(
                "cdp error for {method}: {message}"
            )));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Query the devtools HTTP endpoint for the browser's page targets.
pub async fn list_page_targets(cdp_port: u16) -> Result<Vec<Value>> {
    let url = format!("http://127.0.0.1:{cdp_port}/json/list");
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| ServiceError::DriverGone(format!("devtools http unreachable: {e}")))?;
    let targets: Value = resp
        .json()
        .await
        .map_err(|e| ServiceError::DriverGone(format!("devtools http bad json: {e}")))?;
    Ok(targets
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .collect())
}

/// Ask the browser to open a new page target and return its devtools info (including
/// `webSocketDebuggerUrl`).
pub async fn new_page_target(cdp_port: u16, url: &str) -> Result<Value> {
    let put_url = format!(
        "http://127.0.0.1:{cdp_port}/json/new?{}",
        urlencode(url)
    );
    let client = reqwest::Client::new();
    let resp = client
        .put(&put_url)
        .send()
        .await
        .map_err(|e| ServiceError::DriverGone(format!("devtools http unreachable: {e}")))?;
    resp.json()
        .await
        .map_err(|e| ServiceError::DriverGone(format!("devtools http bad json: {e}")))
}

/// Close a page target by its devtools target id.
pub async fn close_page_target(cdp_port: u16, target_id: &str) -> Result<()> {
    let close_url = format!("http://127.0.0.1:{cdp_port}/json/close/{target_id}");
    reqwest::get(&close_url)
        .await
        .map_err(|e| ServiceError::DriverGone(format!("devtools http unreachable: {e}")))?;
    Ok(())
}

/// Poll `/json/version` until the devtools HTTP endpoint answers or the deadline passes.
pub async fn wait_for_devtools_ready(cdp_port: u16, timeout_ms: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    let url = format!("http://127.0.0.1:{cdp_port}/json/version");
    loop {
        if reqwest::get(&url).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ServiceError::DriverGone(
                "chrome devtools endpoint never came up".to_string(),
            ));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn urlencode(s: &str) -> String {
    let mut client = String::from("url=");
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                client.push(b as char)
            }
            _ => client.push_str(&format!("%{:02X}", b)),
        }
    }
    client
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved() {
        assert_eq!(urlencode("about:blank"), "url=about%3Ablank");
        assert_eq!(urlencode("plain"), "url=plain");
    }
}
