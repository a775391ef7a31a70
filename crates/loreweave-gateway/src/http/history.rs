//! History paging and rollback.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use loreweave_core::LoreweaveError;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_page() -> usize {
    1
}
fn default_size() -> usize {
    50
}

/// GET /v1/history?page=&size=
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.full_history(params.page, params.size) {
        Ok(messages) => {
            let rows: Vec<Value> = messages
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "role": m.role,
                        "content": m.content,
                        "timestamp": m.timestamp,
                    })
                })
                .collect();
            Ok(Json(json!({ "page": params.page, "messages": rows })))
        }
        Err(LoreweaveError::NoActiveSession) => Err(no_session()),
        Err(e) => Err(internal(&e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct RollbackRequest {
    pub message_id: i64,
}

/// POST /v1/rollback
pub async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.rollback(req.message_id).await {
        Ok(()) => Ok(Json(json!({ "status": "ok", "message_id": req.message_id }))),
        Err(LoreweaveError::NoActiveSession) => Err(no_session()),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

fn no_session() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "no active session" })),
    )
}

fn internal(msg: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": msg })),
    )
}
