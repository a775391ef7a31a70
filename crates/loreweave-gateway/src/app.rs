use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use std::sync::Arc;

use loreweave_core::LogBus;
use loreweave_engine::Engine;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub bus: LogBus,
    /// Active log-monitor connections: conn_id -> connected-at RFC3339.
    pub ws_clients: DashMap<String, String>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, bus: LogBus) -> Self {
        Self {
            engine,
            bus,
            ws_clients: DashMap::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::health::root_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/debug/connections",
            get(crate::http::debug::connections_handler),
        )
        .route(
            "/debug/broadcast",
            post(crate::http::debug::broadcast_handler),
        )
        .route("/v1/sessions", get(crate::http::sessions::list_handler))
        .route("/v1/sessions/new", post(crate::http::sessions::new_handler))
        .route(
            "/v1/sessions/load",
            post(crate::http::sessions::load_handler),
        )
        .route(
            "/v1/sessions/delete",
            post(crate::http::sessions::delete_handler),
        )
        .route(
            "/v1/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .route("/v1/history", get(crate::http::history::history_handler))
        .route("/v1/rollback", post(crate::http::history::rollback_handler))
        .route("/ws/logs", get(crate::ws::logs::ws_logs_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
