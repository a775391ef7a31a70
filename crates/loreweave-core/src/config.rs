use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Messages kept in the per-session context window.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
/// Hard cap on rendered history characters in any single prompt.
pub const MAX_HISTORY_CHARS: usize = 30_000;

/// Top-level config (loreweave.json + LOREWEAVE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoreweaveConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub hot_cache: HotCacheConfig,
    /// Provider credentials keyed by a short id (e.g. "silicon", "deepseek").
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub vector: VectorConfig,
    /// Per-role model bindings. One entry per pipeline role key.
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

impl Default for LoreweaveConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            history_limit: default_history_limit(),
            gateway: GatewayConfig::default(),
            hot_cache: HotCacheConfig::default(),
            providers: HashMap::new(),
            vector: VectorConfig::default(),
            roles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Hot cache (redis). Optional: when disabled or unreachable the engine
/// falls back transparently to the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotCacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Cache entry TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for HotCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_redis_url(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

/// A single upstream credential set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name for logs.
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    /// Base URL without trailing slash (e.g. "https://api.siliconflow.cn/v1").
    pub base_url: String,
}

/// Embedding + rerank capability binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Which `providers` entry carries the vector API credentials.
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            embedding_model: default_embedding_model(),
            rerank_model: default_rerank_model(),
        }
    }
}

/// Binds one pipeline role (reflex, director, narrator, …) to a model.
///
/// A `model` ending in `.gguf` selects the local provider; anything else is
/// routed through the named remote provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Role key: reflex | director | narrator | status | draft | critic
    /// | historian | sociologist | seeker
    pub key: String,
    #[serde(default)]
    pub name: String,
    /// `providers` entry to use for remote models.
    #[serde(default)]
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// System prompt for this role. Empty falls back to the built-in default.
    #[serde(default)]
    pub prompt: String,
    /// Secondary provider tried after the primary is exhausted (non-streaming).
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    /// Base URL of the local inference server for `.gguf` models.
    #[serde(default)]
    pub local_server_url: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_vector_provider() -> String {
    "silicon".to_string()
}
fn default_embedding_model() -> String {
    "BAAI/bge-m3".to_string()
}
fn default_rerank_model() -> String {
    "BAAI/bge-reranker-v2-m3".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    8192
}

impl LoreweaveConfig {
    /// Load config from a JSON file with LOREWEAVE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ./loreweave.json
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("loreweave.json");

        let config: LoreweaveConfig = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("LOREWEAVE_").split("__"))
            .extract()
            .map_err(|e| crate::error::LoreweaveError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Resolve a role entry by key.
    pub fn role(&self, key: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.key == key)
    }

    /// Resolve provider credentials for a role, if it is remote.
    pub fn provider_for(&self, role: &RoleConfig) -> Option<&ProviderConfig> {
        self.providers.get(&role.provider)
    }

    /// Credentials for the embedding/rerank endpoints, if configured.
    pub fn vector_provider(&self) -> Option<&ProviderConfig> {
        self.providers.get(&self.vector.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = LoreweaveConfig::default();
        assert_eq!(cfg.history_limit, 20);
        assert_eq!(cfg.gateway.port, 8000);
        assert!(cfg.hot_cache.enabled);
        assert!(cfg.roles.is_empty());
    }

    #[test]
    fn role_lookup_by_key() {
        let mut cfg = LoreweaveConfig::default();
        cfg.roles.push(RoleConfig {
            key: "narrator".into(),
            name: "Narrator".into(),
            provider: "silicon".into(),
            model: "test-model".into(),
            temperature: 0.7,
            max_tokens: 4096,
            prompt: String::new(),
            fallback_provider: None,
            fallback_model: None,
            local_server_url: None,
        });
        assert!(cfg.role("narrator").is_some());
        assert!(cfg.role("director").is_none());
    }

    #[test]
    fn parses_minimal_json() {
        let doc = serde_json::json!({
            "providers": {
                "silicon": { "api_key": "sk-x", "base_url": "https://api.example.com/v1" }
            },
            "roles": [
                { "key": "narrator", "provider": "silicon", "model": "qwen-plus" }
            ]
        });
        let cfg: LoreweaveConfig = serde_json::from_value(doc).expect("parse failed");
        let role = cfg.role("narrator").unwrap();
        assert_eq!(role.temperature, 0.7);
        assert_eq!(role.max_tokens, 8192);
        assert_eq!(cfg.provider_for(role).unwrap().base_url, "https://api.example.com/v1");
    }
}
