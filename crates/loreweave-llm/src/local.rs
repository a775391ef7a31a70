//! Local on-disk model provider.
//!
//! Talks to a llama.cpp-compatible server running the model on this host.
//! The server decodes one request at a time, so all calls are serialised
//! through a per-model generation lock; the instance registry guarantees a
//! single provider (and therefore a single lock) per model path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::remote::process_sse_stream;
use crate::stream::StreamEvent;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

static INSTANCES: OnceLock<Mutex<HashMap<String, Arc<LocalProvider>>>> = OnceLock::new();

pub struct LocalProvider {
    client: reqwest::Client,
    model_path: String,
    model_name: String,
    server_url: String,
    /// Local inference is not re-entrant — one generation at a time.
    generation_lock: tokio::sync::Mutex<()>,
}

impl LocalProvider {
    /// One process-wide instance per model path. The registry lock protects
    /// creation; the generation lock protects inference.
    pub fn instance(model_path: &str, server_url: &str) -> Arc<Self> {
        let registry = INSTANCES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = registry.lock().unwrap();

        if let Some(existing) = map.get(model_path) {
            debug!(model = %existing.model_name, "reusing loaded local model instance");
            return existing.clone();
        }

        let model_name = std::path::Path::new(model_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local-gguf".to_string());
        info!(%model_path, %server_url, "binding new local model instance");

        let provider = Arc::new(Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            model_path: model_path.to_string(),
            model_name,
            server_url: server_url.trim_end_matches('/').to_string(),
            generation_lock: tokio::sync::Mutex::new(()),
        });
        map.insert(model_path.to_string(), provider.clone());
        provider
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.server_url)
    }

    async fn send(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = crate::remote::build_request_body(&self.model_name, req, stream);
        let resp = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // A dead local server is an availability problem, not an API one.
                if e.is_connect() || e.is_timeout() {
                    ProviderError::Unavailable(e.to_string())
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "local model server error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn generate(&self, req: &ChatRequest) -> Result<String, ProviderError> {
        let _guard = self.generation_lock.lock().await;
        debug!(model = %self.model_name, "local generate");

        let resp = self.send(req, false).await?;
        let api_resp: LocalResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(api_resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        // Held across the whole stream — decoding runs until the last token.
        let _guard = self.generation_lock.lock().await;
        debug!(model = %self.model_name, "local generate_stream");

        let resp = self.send(req, true).await?;
        process_sse_stream(resp, tx).await;
        Ok(())
    }
}

#[derive(Deserialize)]
struct LocalResponse {
    choices: Vec<LocalChoice>,
}

#[derive(Deserialize)]
struct LocalChoice {
    message: LocalMessage,
}

#[derive(Deserialize)]
struct LocalMessage {
    content: Option<String>,
}
