//! Session REST: list, create, load, delete.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /v1/sessions
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions = state.engine.list_sessions().unwrap_or_default();
    let rows: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "uuid": s.uuid,
                "character_name": s.character_name,
                "created_at": s.created_at,
            })
        })
        .collect();
    Json(json!({ "sessions": rows }))
}

#[derive(Deserialize)]
pub struct NewSessionRequest {
    pub user_name: String,
    #[serde(default)]
    pub char_name: Option<String>,
    #[serde(default)]
    pub char_persona: Option<String>,
}

/// POST /v1/sessions/new
pub async fn new_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewSessionRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if req.user_name.trim().is_empty() {
        return Err(bad_request("user_name must not be empty"));
    }
    match state
        .engine
        .start_new_session(
            &req.user_name,
            req.char_name.as_deref(),
            req.char_persona.as_deref(),
        )
        .await
    {
        Ok(uuid) => Ok(Json(json!({ "uuid": uuid }))),
        Err(e) => {
            warn!(err = %e, "session create failed");
            Err(internal(&e.to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct SessionRef {
    pub uuid: String,
}

/// POST /v1/sessions/load
pub async fn load_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRef>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.load_session(&req.uuid).await {
        Ok(()) => Ok(Json(json!({ "status": "ok", "uuid": req.uuid }))),
        Err(loreweave_core::LoreweaveError::SessionNotFound { uuid }) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("session not found: {uuid}") })),
        )),
        Err(e) => Err(internal(&e.to_string())),
    }
}

/// POST /v1/sessions/delete
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRef>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.delete_session(&req.uuid).await {
        Ok(deleted) => Ok(Json(json!({ "deleted": deleted }))),
        Err(e) => Err(internal(&e.to_string())),
    }
}

fn bad_request(msg: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

fn internal(msg: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": msg })),
    )
}
