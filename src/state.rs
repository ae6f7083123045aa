use std::sync::Arc;

use crate::api::ws::WsBroadcaster;
use crate::config::ServiceConfig;
use crate::page_manager::PageManager;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub manager: Arc<PageManager>,
    pub ws: WsBroadcaster,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        let manager = Arc::new(PageManager::new(config.clone()));
        Self {
            config: Arc::new(config),
            manager,
            ws: WsBroadcaster::new(),
        }
    }

    /// Broadcast a WebSocket event to all connected clients.
    pub fn broadcast_ws(&self, event: crate::api::ws::WsEvent) {
        self.ws.broadcast(event);
    }
}
