//! Hot cache: per-session context window and latest state in redis.
//!
//! Strictly best-effort. When redis is disabled or unreachable every call
//! degrades to a no-op / cache miss and the engine reads the relational
//! store instead. Nothing here is load-bearing for correctness.

use redis::AsyncCommands;
use serde_json::Value;
use tracing::{info, warn};

use loreweave_core::config::HotCacheConfig;

use crate::types::ContextMessage;

pub struct HotCache {
    conn: Option<redis::aio::MultiplexedConnection>,
    ttl_secs: u64,
}

impl HotCache {
    /// Connect once at startup. A failed connection downgrades to the
    /// disabled cache rather than erroring.
    pub async fn connect(cfg: &HotCacheConfig) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }

        let conn = match redis::Client::open(cfg.url.as_str()) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    info!(url = %cfg.url, "hot cache connected");
                    Some(conn)
                }
                Err(e) => {
                    warn!(err = %e, "hot cache unreachable, falling back to relational store");
                    None
                }
            },
            Err(e) => {
                warn!(err = %e, "bad hot cache url, falling back to relational store");
                None
            }
        };

        Self {
            conn,
            ttl_secs: cfg.ttl_secs,
        }
    }

    pub fn disabled() -> Self {
        Self {
            conn: None,
            ttl_secs: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn context_key(uuid: &str) -> String {
        format!("session:{uuid}:context")
    }

    fn state_key(uuid: &str) -> String {
        format!("session:{uuid}:state")
    }

    async fn set(&self, key: String, payload: String) {
        let Some(conn) = &self.conn else { return };
        let mut conn = conn.clone();
        if let Err(e) = conn.set_ex::<_, _, ()>(key, payload, self.ttl_secs).await {
            warn!(err = %e, "hot cache write failed");
        }
    }

    async fn get(&self, key: String) -> Option<String> {
        let conn = self.conn.as_ref()?;
        let mut conn = conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "hot cache read failed");
                None
            }
        }
    }

    async fn del(&self, key: String) {
        let Some(conn) = &self.conn else { return };
        let mut conn = conn.clone();
        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!(err = %e, "hot cache delete failed");
        }
    }

    /// Cache the recent context window. Callers trim to the history limit
    /// before writing.
    pub async fn cache_context(&self, uuid: &str, messages: &[ContextMessage]) {
        if let Ok(payload) = serde_json::to_string(messages) {
            self.set(Self::context_key(uuid), payload).await;
        }
    }

    /// `None` means cache miss — read the relational store.
    pub async fn context(&self, uuid: &str) -> Option<Vec<ContextMessage>> {
        let data = self.get(Self::context_key(uuid)).await?;
        serde_json::from_str(&data).ok()
    }

    pub async fn clear_context(&self, uuid: &str) {
        self.del(Self::context_key(uuid)).await;
    }

    pub async fn cache_state(&self, uuid: &str, state: &Value) {
        if let Ok(payload) = serde_json::to_string(state) {
            self.set(Self::state_key(uuid), payload).await;
        }
    }

    pub async fn state(&self, uuid: &str) -> Option<Value> {
        let data = self.get(Self::state_key(uuid)).await?;
        serde_json::from_str(&data).ok()
    }

    pub async fn clear_state(&self, uuid: &str) {
        self.del(Self::state_key(uuid)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_is_a_silent_miss() {
        let cache = HotCache::disabled();
        assert!(!cache.enabled());

        cache
            .cache_context(
                "some-uuid",
                &[ContextMessage {
                    role: "user".into(),
                    content: "hello".into(),
                }],
            )
            .await;
        assert!(cache.context("some-uuid").await.is_none());

        cache
            .cache_state("some-uuid", &serde_json::json!({"x": 1}))
            .await;
        assert!(cache.state("some-uuid").await.is_none());

        // clears are no-ops, not panics
        cache.clear_context("some-uuid").await;
        cache.clear_state("some-uuid").await;
    }
}
