use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET / — identity banner.
pub async fn root_handler() -> Json<Value> {
    Json(json!({
        "name": "loreweave",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/v1/sessions", "/v1/chat/completions", "/ws/logs"],
    }))
}

/// GET /health — liveness probe plus engine snapshot.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "ws_clients": state.ws_clients.len(),
        "engine": state.engine.status_snapshot(),
    }))
}
