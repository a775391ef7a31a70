//! Role bindings: each pipeline stage (reflex, director, narrator, …) is a
//! named pairing of a provider, a model, sampling settings and a system
//! prompt, resolved once from config at startup.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use loreweave_core::config::{LoreweaveConfig, RoleConfig};

use crate::local::LocalProvider;
use crate::provider::{ChatRequest, LlmProvider, Message, NullProvider, ProviderError};
use crate::remote::{FallbackTarget, RemoteProvider};
use crate::stream::StreamEvent;

const DEFAULT_LOCAL_SERVER: &str = "http://127.0.0.1:8080";

/// A provider bound to one pipeline role.
#[derive(Clone)]
pub struct RoleClient {
    key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    prompt: String,
    provider: Arc<dyn LlmProvider>,
}

impl RoleClient {
    /// Resolve a role from config. A missing or incomplete entry yields a
    /// null-backed client whose callers fall through to their deterministic
    /// fallbacks.
    pub fn from_config(cfg: &LoreweaveConfig, key: &str) -> Self {
        let Some(role) = cfg.role(key) else {
            warn!(role = key, "no role binding in config, using null provider");
            return Self::null(key);
        };

        let provider: Arc<dyn LlmProvider> = if role.model.to_lowercase().ends_with(".gguf") {
            let server = role
                .local_server_url
                .as_deref()
                .unwrap_or(DEFAULT_LOCAL_SERVER);
            info!(role = key, model = %role.model, "binding role to local model");
            LocalProvider::instance(&role.model, server)
        } else {
            match cfg.provider_for(role) {
                Some(p) => {
                    info!(role = key, model = %role.model, provider = %role.provider, "binding role to remote provider");
                    Arc::new(RemoteProvider::new(
                        role.provider.clone(),
                        p.api_key.clone(),
                        p.base_url.clone(),
                        resolve_fallback(cfg, role),
                    ))
                }
                None => {
                    warn!(role = key, provider = %role.provider, "unknown provider for role, using null provider");
                    Arc::new(NullProvider)
                }
            }
        };

        Self {
            key: key.to_string(),
            model: role.model.clone(),
            temperature: role.temperature,
            max_tokens: role.max_tokens,
            prompt: role.prompt.clone(),
            provider,
        }
    }

    /// Test seam: bind a role to an arbitrary provider.
    pub fn with_provider(key: &str, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            key: key.to_string(),
            model: "test-model".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            prompt: String::new(),
            provider,
        }
    }

    fn null(key: &str) -> Self {
        Self::with_provider(key, Arc::new(NullProvider))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Configured system prompt; empty when the config carries none.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    fn request(&self, messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub async fn generate(&self, messages: Vec<Message>) -> Result<String, ProviderError> {
        self.provider.generate(&self.request(messages)).await
    }

    pub async fn generate_stream(
        &self,
        messages: Vec<Message>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.provider
            .generate_stream(&self.request(messages), tx)
            .await
    }
}

/// All role bindings the pipeline needs, resolved once at startup.
#[derive(Clone)]
pub struct RoleSet {
    pub reflex: RoleClient,
    pub director: RoleClient,
    pub narrator: RoleClient,
    pub status: RoleClient,
    pub draft: RoleClient,
    pub critic: RoleClient,
    pub historian: RoleClient,
    pub sociologist: RoleClient,
    pub seeker: RoleClient,
}

impl RoleSet {
    pub fn from_config(cfg: &LoreweaveConfig) -> Self {
        Self {
            reflex: RoleClient::from_config(cfg, "reflex"),
            director: RoleClient::from_config(cfg, "director"),
            narrator: RoleClient::from_config(cfg, "narrator"),
            status: RoleClient::from_config(cfg, "status"),
            draft: RoleClient::from_config(cfg, "draft"),
            critic: RoleClient::from_config(cfg, "critic"),
            historian: RoleClient::from_config(cfg, "historian"),
            sociologist: RoleClient::from_config(cfg, "sociologist"),
            seeker: RoleClient::from_config(cfg, "seeker"),
        }
    }
}

fn resolve_fallback(cfg: &LoreweaveConfig, role: &RoleConfig) -> Option<FallbackTarget> {
    let provider_key = role.fallback_provider.as_deref()?;
    let model = role.fallback_model.as_deref()?;
    let provider = cfg.providers.get(provider_key)?;
    Some(FallbackTarget {
        name: provider_key.to_string(),
        api_key: provider.api_key.clone(),
        base_url: provider.base_url.clone(),
        model: model.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Scripted(&'static str);

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, _req: &ChatRequest) -> Result<String, ProviderError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn role_client_forwards_to_provider() {
        let client = RoleClient::with_provider("reflex", Arc::new(Scripted("search query")));
        let out = client.generate(vec![Message::user("hello")]).await.unwrap();
        assert_eq!(out, "search query");
    }

    #[tokio::test]
    async fn unconfigured_role_fails_as_unavailable() {
        let cfg = LoreweaveConfig::default();
        let client = RoleClient::from_config(&cfg, "director");
        let err = client
            .generate(vec![Message::user("plan")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
