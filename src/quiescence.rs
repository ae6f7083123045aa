//! Quiescence detector (C4): resolves "the page is settled enough to act on" from the raw
//! CDP network/page event stream, independent of any particular action being in flight.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::driver::cdp::CdpEvent;

const QUIET_WINDOW: Duration = Duration::from_millis(500);
const STALL_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const STALL_AGE: Duration = Duration::from_secs(2);
const DEFAULT_HARD_DEADLINE_MS: u64 = 30_000;

struct RequestMeta {
    #[allow(dead_code)]
    url: String,
    started_at: Instant,
}

/// Per-call bookkeeping. A fresh instance is built for every `wait_for_settled` call so
/// concurrent waiters never share mutable state; only the broadcast receiver is shared.
struct Bookkeeping {
    inflight: HashSet<String>,
    meta: HashMap<String, RequestMeta>,
    doc_by_frame: HashMap<String, String>,
}

impl Bookkeeping {
    fn new() -> Self {
        Self {
            inflight: HashSet::new(),
            meta: HashMap::new(),
            doc_by_frame: HashMap::new(),
        }
    }

    fn complete(&mut self, request_id: &str) {
        self.inflight.remove(request_id);
        self.meta.remove(request_id);
        self.doc_by_frame.retain(|_, v| v != request_id);
    }

    fn sweep_stalled(&mut self) -> bool {
        let now = Instant::now();
        let stalled: Vec<String> = self
            .meta
            .iter()
            .filter(|(_, m)| now.duration_since(m.started_at) >= STALL_AGE)
            .map(|(id, _)| id.clone())
            .collect();
        let any = !stalled.is_empty();
        for id in stalled {
            tracing::warn!(request_id = %id, "dropping stalled inflight request from quiescence bookkeeping");
            self.complete(&id);
        }
        any
    }
}

/// Wait for the page to be quiet: no in-flight non-streaming request for [`QUIET_WINDOW`], or
/// `timeout_ms` elapsed, whichever comes first. Resolves exactly once.
pub async fn wait_for_settled(mut events: broadcast::Receiver<CdpEvent>, timeout_ms: Option<u64>) {
    let timeout_ms = timeout_ms.unwrap_or(DEFAULT_HARD_DEADLINE_MS);
    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(deadline);

    let mut book = Bookkeeping::new();
    let mut stall_sweep = tokio::time::interval(STALL_SWEEP_INTERVAL);
    // No request has ever arrived, so the page starts quiet: arm the timer immediately rather
    // than waiting for a completion event that may never come.
    let mut quiet_timer: Option<std::pin::Pin<Box<tokio::time::Sleep>>> =
        Some(Box::pin(tokio::time::sleep(QUIET_WINDOW)));
    let mut done_once = false;

    loop {
        if done_once {
            return;
        }
        tokio::select! {
            biased;

            _ = &mut deadline => {
                if !book.inflight.is_empty() {
                    tracing::warn!(inflight = book.inflight.len(), "quiescence hard deadline hit with requests still inflight");
                }
                done_once = true;
            }

            _ = async { if let Some(t) = quiet_timer.as_mut() { t.as_mut().await } else { std::future::pending().await } }, if quiet_timer.is_some() => {
                done_once = true;
            }

            _ = stall_sweep.tick() => {
                let changed = book.sweep_stalled();
                if changed && book.inflight.is_empty() {
                    quiet_timer = Some(Box::pin(tokio::time::sleep(QUIET_WINDOW)));
                }
            }

            ev = events.recv() => {
                let Ok(ev) = ev else { continue };
                handle_event(&mut book, &ev, &mut quiet_timer);
            }
        }
    }
}

fn handle_event(
    book: &mut Bookkeeping,
    ev: &CdpEvent,
    quiet_timer: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
) {
    match ev.method.as_str() {
        "Network.requestWillBeSent" => {
            let resource_type = ev
                .params
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if resource_type == "WebSocket" || resource_type == "EventSource" {
                return;
            }
            let Some(request_id) = ev
                .params
                .get("requestId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
            else {
                return;
            };
            let url = ev
                .params
                .get("request")
                .and_then(|r| r.get("url"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            book.inflight.insert(request_id.clone());
            book.meta.insert(
                request_id.clone(),
                RequestMeta {
                    url,
                    started_at: Instant::now(),
                },
            );
            if resource_type == "Document" {
                if let Some(frame_id) = ev.params.get("frameId").and_then(|v| v.as_str()) {
                    book.doc_by_frame
                        .insert(frame_id.to_string(), request_id);
                }
            }
            *quiet_timer = None;
        }
        "Network.loadingFinished" | "Network.loadingFailed" | "Network.requestServedFromCache" => {
            if let Some(request_id) = ev.params.get("requestId").and_then(|v| v.as_str()) {
                book.complete(request_id);
            }
            maybe_start_quiet_timer(book, quiet_timer);
        }
        "Network.responseReceived" => {
            let is_data_url = ev
                .params
                .get("response")
                .and_then(|r| r.get("url"))
                .and_then(|v| v.as_str())
                .map(|u| u.starts_with("data:"))
                .unwrap_or(false);
            if is_data_url {
                if let Some(request_id) = ev.params.get("requestId").and_then(|v| v.as_str()) {
                    book.complete(request_id);
                }
                maybe_start_quiet_timer(book, quiet_timer);
            }
        }
        "Page.frameStoppedLoading" => {
            if let Some(frame_id) = ev.params.get("frameId").and_then(|v| v.as_str()) {
                if let Some(request_id) = book.doc_by_frame.get(frame_id).cloned() {
                    book.complete(&request_id);
                    maybe_start_quiet_timer(book, quiet_timer);
                }
            }
        }
        _ => {}
    }
}

fn maybe_start_quiet_timer(
    book: &Bookkeeping,
    quiet_timer: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
) {
    if book.inflight.is_empty() && quiet_timer.is_none() {
        *quiet_timer = Some(Box::pin(tokio::time::sleep(QUIET_WINDOW)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(method: &str, params: serde_json::Value) -> CdpEvent {
        CdpEvent {
            session_id: None,
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn websocket_requests_are_ignored() {
        let mut book = Bookkeeping::new();
        let mut timer = None;
        handle_event(
            &mut book,
            &event(
                "Network.requestWillBeSent",
                serde_json::json!({"requestId": "1", "type": "WebSocket", "request": {"url": "wss://x"}}),
            ),
            &mut timer,
        );
        assert!(book.inflight.is_empty());
    }

    #[test]
    fn document_request_tracked_by_frame() {
        let mut book = Bookkeeping::new();
        let mut timer = None;
        handle_event(
            &mut book,
            &event(
                "Network.requestWillBeSent",
                serde_json::json!({"requestId": "1", "type": "Document", "frameId": "f1", "request": {"url": "https://x"}}),
            ),
            &mut timer,
        );
        assert_eq!(book.doc_by_frame.get("f1"), Some(&"1".to_string()));
        handle_event(
            &mut book,
            &event("Page.frameStoppedLoading", serde_json::json!({"frameId": "f1"})),
            &mut timer,
        );
        assert!(book.inflight.is_empty());
        assert!(book.doc_by_frame.is_empty());
    }

    #[test]
    fn loading_finished_removes_from_inflight() {
        let mut book = Bookkeeping::new();
        let mut timer = None;
        handle_event(
            &mut book,
            &event(
                "Network.requestWillBeSent",
                serde_json::json!({"requestId": "1", "type": "Fetch", "request": {"url": "https://x"}}),
            ),
            &mut timer,
        );
        assert_eq!(book.inflight.len(), 1);
        handle_event(
            &mut book,
            &event("Network.loadingFinished", serde_json::json!({"requestId": "1"})),
            &mut timer,
        );
        assert!(book.inflight.is_empty());
        assert!(timer.is_some());
    }

    #[test]
    fn data_url_response_completes_request() {
        let mut book = Bookkeeping::new();
        let mut timer = None;
        handle_event(
            &mut book,
            &event(
                "Network.requestWillBeSent",
                serde_json::json!({"requestId": "1", "type": "Image", "request": {"url": "data:image/png;base64,x"}}),
            ),
            &mut timer,
        );
        handle_event(
            &mut book,
            &event(
                "Network.responseReceived",
                serde_json::json!({"requestId": "1", "response": {"url": "data:image/png;base64,x"}}),
            ),
            &mut timer,
        );
        assert!(book.inflight.is_empty());
    }

    #[tokio::test]
    async fn settles_quickly_with_no_traffic() {
        let (tx, rx) = broadcast::channel(16);
        drop(tx);
        let started = Instant::now();
        wait_for_settled(rx, Some(2_000)).await;
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn settles_at_hard_deadline_when_request_never_completes() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(event(
            "Network.requestWillBeSent",
            serde_json::json!({"requestId": "1", "type": "Fetch", "request": {"url": "https://x"}}),
        ))
        .unwrap();
        let started = Instant::now();
        wait_for_settled(rx, Some(600)).await;
        assert!(started.elapsed() >= Duration::from_millis(550));
        drop(tx);
    }
}
