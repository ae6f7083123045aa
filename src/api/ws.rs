//! WebSocket broadcast server for page-level events.
//!
//! Pushes `page-created`, `page-closed`, and `action-recorded` envelopes to every connected
//! subscriber; the page manager is the sole producer (see `spawn_event_bridge` in `lib.rs`).

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::page_manager::PageInfo;
use crate::state::AppState;

const CHANNEL_CAPACITY: usize = 100;

/// WebSocket envelope pushed to clients: `{"type": "...", "data": {...}}`.
#[derive(Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsEvent {
    #[serde(rename = "page-created")]
    PageCreated(PageInfo),
    #[serde(rename = "page-closed")]
    PageClosed { id: String },
    #[serde(rename = "action-recorded")]
    ActionRecorded {
        page_id: String,
        record: serde_json::Value,
    },
}

/// Shared broadcast sender for WebSocket events. Best-effort: a lagging or dropped subscriber
/// just misses events, it never blocks the action path.
#[derive(Clone)]
pub struct WsBroadcaster {
    tx: broadcast::Sender<WsEvent>,
}

impl WsBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: WsEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ws.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                // axum answers pings with pongs automatically; nothing else to act on here.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
