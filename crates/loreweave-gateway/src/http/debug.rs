use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use loreweave_core::logbus::LogEvent;

use crate::app::AppState;

/// GET /debug/connections — who is watching the log stream.
pub async fn connections_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let clients: Vec<Value> = state
        .ws_clients
        .iter()
        .map(|entry| json!({ "id": entry.key(), "connected_at": entry.value() }))
        .collect();
    Json(json!({ "count": clients.len(), "clients": clients }))
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

/// POST /debug/broadcast — push an arbitrary line to every monitor.
pub async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BroadcastRequest>,
) -> Json<Value> {
    state.bus.publish(LogEvent::log("INFO", req.message));
    Json(json!({ "sent": true }))
}
