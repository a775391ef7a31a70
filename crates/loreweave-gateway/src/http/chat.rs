//! OpenAI-compatible /v1/chat/completions endpoint.
//! Lets any OpenAI-speaking front end (SillyTavern, Cursor, plain curl)
//! drive the narrator pipeline.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use loreweave_engine::ChatOptions;

use crate::app::AppState;

/// POST /v1/chat/completions — streamed SSE or one-shot JSON.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let user_message = req.last_user_message().ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("no user message found")),
        )
    })?;

    info!(
        stream = req.stream,
        deep = req.deep_mode,
        lite = req.lite_mode,
        "chat completion request"
    );
    let opts = ChatOptions {
        deep_mode: req.deep_mode,
        lite_mode: req.lite_mode,
    };

    if req.stream {
        Ok(handle_streaming(&state, user_message, opts)
            .await
            .into_response())
    } else {
        Ok(handle_non_streaming(&state, user_message, opts)
            .await
            .into_response())
    }
}

async fn handle_non_streaming(
    state: &Arc<AppState>,
    message: String,
    opts: ChatOptions,
) -> impl IntoResponse {
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let collector = tokio::spawn(async move {
        let mut full = String::new();
        while let Some(chunk) = rx.recv().await {
            full.push_str(&chunk);
        }
        full
    });

    let engine = state.engine.clone();
    let _ = engine.chat(&message, opts, tx).await;
    let content = collector.await.unwrap_or_default();

    let reply = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        model: "loreweave".to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(OutgoingMessage {
                role: "assistant".to_string(),
                content: Some(content),
            }),
            delta: None,
            finish_reason: Some("stop".to_string()),
        }],
    };
    (StatusCode::OK, Json(reply)).into_response()
}

async fn handle_streaming(
    state: &Arc<AppState>,
    message: String,
    opts: ChatOptions,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    let engine = state.engine.clone();
    tokio::spawn(async move {
        let _ = engine.chat(&message, opts, tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(text) = rx.recv().await {
            let chunk = ChatCompletionResponse {
                id: id.clone(),
                object: "chat.completion.chunk".to_string(),
                model: "loreweave".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: None,
                    delta: Some(OutgoingMessage {
                        role: "assistant".to_string(),
                        content: Some(text),
                    }),
                    finish_reason: None,
                }],
            };
            let json = serde_json::to_string(&chunk).unwrap_or_default();
            yield Ok(Event::default().data(json));
        }

        let done = ChatCompletionResponse {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            model: "loreweave".to_string(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(OutgoingMessage {
                    role: "assistant".to_string(),
                    content: None,
                }),
                finish_reason: Some("stop".to_string()),
            }],
        };
        let json = serde_json::to_string(&done).unwrap_or_default();
        yield Ok(Event::default().data(json));
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── request / response types ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    #[allow(dead_code)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    /// Bare-input alternative to a messages array.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub deep_mode: bool,
    #[serde(default)]
    pub lite_mode: bool,
}

#[derive(Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    /// Plain string or multimodal part array.
    #[serde(default)]
    pub content: Value,
}

impl ChatCompletionRequest {
    /// Last user message; multimodal content keeps only its text parts.
    /// Falls back to the `input` field.
    pub fn last_user_message(&self) -> Option<String> {
        let from_messages = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| extract_text(&m.content));
        from_messages.or_else(|| {
            self.input
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .cloned()
        })
    }
}

fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let text: Vec<String> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(String::from)
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: String,
    model: String,
    choices: Vec<Choice>,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<OutgoingMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<OutgoingMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Serialize)]
struct OutgoingMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Serialize)]
pub struct ApiError {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl ApiError {
    pub fn new(msg: &str) -> Self {
        Self {
            error: ErrorBody {
                message: msg.to_string(),
                error_type: "invalid_request_error".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(v: Value) -> ChatCompletionRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn plain_string_message_extracts() {
        let req = request(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        }));
        assert_eq!(req.last_user_message().unwrap(), "second");
    }

    #[test]
    fn multimodal_parts_join_text_only() {
        let req = request(json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image_url", "image_url": {"url": "http://x/y.png"}},
                    {"type": "text", "text": "what is it?"}
                ]
            }]
        }));
        assert_eq!(req.last_user_message().unwrap(), "look at this\nwhat is it?");
    }

    #[test]
    fn input_field_is_the_fallback() {
        let req = request(json!({ "input": "hello there" }));
        assert_eq!(req.last_user_message().unwrap(), "hello there");

        let req = request(json!({ "messages": [], "input": "  " }));
        assert!(req.last_user_message().is_none());
    }
}
