use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Retries against the same endpoint before giving up on it.
const MAX_RETRIES: u32 = 2;
/// Back-off between retries.
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Whole-request timeout. Long-form generations can take minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Secondary endpoint tried once the primary is exhausted (non-streaming only).
#[derive(Debug, Clone)]
pub struct FallbackTarget {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

/// Chat-completion client for any OpenAI-compatible endpoint.
pub struct RemoteProvider {
    client: reqwest::Client,
    provider_name: String,
    api_key: String,
    base_url: String,
    fallback: Option<FallbackTarget>,
}

impl RemoteProvider {
    /// `base_url` should NOT include a trailing slash.
    pub fn new(
        name: impl Into<String>,
        api_key: String,
        base_url: String,
        fallback: Option<FallbackTarget>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            provider_name: name.into(),
            api_key,
            base_url,
            fallback,
        }
    }

    fn endpoint(base_url: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    async fn send_once(
        &self,
        model: &str,
        api_key: &str,
        base_url: &str,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = build_request_body(model, req, stream);
        let resp = self
            .client
            .post(Self::endpoint(base_url))
            .bearer_auth(api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }

    /// One endpoint, with retries on 5xx/429/transport errors.
    async fn generate_with_retry(
        &self,
        tag: &str,
        model: &str,
        api_key: &str,
        base_url: &str,
        req: &ChatRequest,
    ) -> Result<String, ProviderError> {
        let mut last_err = ProviderError::Unavailable("no attempt made".to_string());

        for attempt in 0..=MAX_RETRIES {
            match self.send_once(model, api_key, base_url, req, false).await {
                Ok(resp) => {
                    let api_resp: ApiResponse = resp
                        .json()
                        .await
                        .map_err(|e| ProviderError::Parse(e.to_string()))?;
                    let content = api_resp
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .unwrap_or_default();
                    if attempt > 0 {
                        debug!(%tag, %model, attempt, "request succeeded after retry");
                    }
                    return Ok(content);
                }
                Err(e) => {
                    warn!(%tag, %model, attempt, err = %e, "chat completion failed");
                    let retryable = e.is_retryable();
                    last_err = e;
                    if !retryable {
                        break;
                    }
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl LlmProvider for RemoteProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn generate(&self, req: &ChatRequest) -> Result<String, ProviderError> {
        debug!(model = %req.model, provider = %self.provider_name, "sending chat request");

        let primary = self
            .generate_with_retry("primary", &req.model, &self.api_key, &self.base_url, req)
            .await;

        match primary {
            Ok(text) => Ok(text),
            Err(primary_err) => {
                let Some(fb) = &self.fallback else {
                    return Err(primary_err);
                };
                warn!(
                    provider = %self.provider_name,
                    fallback = %fb.name,
                    err = %primary_err,
                    "primary exhausted, switching to fallback provider"
                );
                self.generate_with_retry("fallback", &fb.model, &fb.api_key, &fb.base_url, req)
                    .await
            }
        }
    }

    /// Streaming has no fallback — a broken stream is truncated, not replayed.
    async fn generate_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        debug!(model = %req.model, provider = %self.provider_name, "sending streaming chat request");

        let resp = self
            .send_once(&req.model, &self.api_key, &self.base_url, req, true)
            .await?;

        process_sse_stream(resp, tx).await;
        Ok(())
    }
}

pub(crate) fn build_request_body(model: &str, req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.to_string(),
                "content": m.content,
            })
        })
        .collect();

    serde_json::json!({
        "model": model,
        "messages": messages,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
        "stream": stream,
    })
}

/// Consume an OpenAI-style SSE body, forwarding text deltas.
/// `data: [DONE]` terminates the stream.
pub(crate) async fn process_sse_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut stop_reason = String::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                if data.trim() == "[DONE]" {
                    break 'outer;
                }
                if let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) {
                    for choice in &chunk_resp.choices {
                        if let Some(reason) = &choice.finish_reason {
                            if !reason.is_empty() {
                                stop_reason = reason.clone();
                            }
                        }
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty()
                                && tx
                                    .send(StreamEvent::TextDelta {
                                        text: content.clone(),
                                    })
                                    .await
                                    .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx.send(StreamEvent::Done { stop_reason }).await;
}

// OpenAI-compatible response types

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn request_body_shape() {
        let req = ChatRequest {
            model: "ignored".into(),
            messages: vec![Message::system("be brief"), Message::user("hi")],
            temperature: 0.3,
            max_tokens: 1024,
        };
        let body = build_request_body("qwen-plus", &req, true);
        assert_eq!(body["model"], "qwen-plus");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            RemoteProvider::endpoint("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn stream_chunk_parses_delta() {
        let data = r#"{"choices":[{"delta":{"content":"你好"},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("你好"));
    }
}
