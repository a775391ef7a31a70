use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

/// A single message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Request to an LLM provider. The system prompt, when any, travels as the
/// first message — providers do not treat it specially.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Common interface over remote HTTP providers and local on-host models.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming request, wait for the full reply text.
    async fn generate(&self, req: &ChatRequest) -> Result<String, ProviderError>;

    /// Stream reply chunks through a channel.
    /// Default: falls back to non-streaming, emits one TextDelta + Done.
    async fn generate_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let text = self.generate(req).await?;
        let _ = tx.send(StreamEvent::TextDelta { text }).await;
        let _ = tx
            .send(StreamEvent::Done {
                stop_reason: "stop".to_string(),
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether a retry against the same provider is worth attempting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Http(_) | Self::Unavailable(_) => true,
            Self::Parse(_) => false,
        }
    }
}

/// Placeholder for an unconfigured role. Every call fails with
/// `Unavailable`, which consumers translate into their deterministic
/// fallback (empty plan, clock advance, no triples, …).
pub struct NullProvider;

#[async_trait]
impl LlmProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn generate(&self, _req: &ChatRequest) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("role not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        for role in [Role::System, Role::User, Role::Assistant] {
            let parsed: Role = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("narrator".parse::<Role>().is_err());
    }

    #[test]
    fn retryability_by_status() {
        assert!(ProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Api {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Parse("bad json".into()).is_retryable());
    }

    #[tokio::test]
    async fn default_stream_falls_back_to_generate() {
        struct Fixed;
        #[async_trait]
        impl LlmProvider for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            async fn generate(&self, _req: &ChatRequest) -> Result<String, ProviderError> {
                Ok("hello".to_string())
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![Message::user("hi")],
            temperature: 0.7,
            max_tokens: 64,
        };
        Fixed.generate_stream(&req, tx).await.unwrap();
        match rx.recv().await.unwrap() {
            StreamEvent::TextDelta { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Done { .. }
        ));
    }
}
