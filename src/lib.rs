pub mod actions;
pub mod api;
pub mod axview;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame_registry;
pub mod page_manager;
pub mod quiescence;
pub mod recorder;
pub mod replay;
pub mod state;

use std::sync::Arc;

use api::ws::WsEvent;
use config::ServiceConfig;
use page_manager::ManagerEvent;
use state::AppState;

/// Bridge the page manager's internal event bus onto the WebSocket broadcaster, so every API
/// handler stays free of direct `ws` bookkeeping: one producer, one consumer.
fn spawn_event_bridge(state: Arc<AppState>) {
    let mut rx = state.manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let ws_event = match event {
                ManagerEvent::PageCreated(info) => WsEvent::PageCreated(info),
                ManagerEvent::PageClosed { id } => WsEvent::PageClosed { id },
                ManagerEvent::ActionRecorded { page_id, record } => {
                    WsEvent::ActionRecorded { page_id, record }
                }
            };
            state.broadcast_ws(ws_event);
        }
    });
}

/// Build configuration from the environment, wire the event bridge, and serve the API.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env();
    let port = config.port;
    let state = Arc::new(AppState::new(config));

    spawn_event_bridge(state.clone());

    api::run_server(state, port).await
}
