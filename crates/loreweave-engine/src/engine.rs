//! The engine: owns every store handle and the active-session slot.
//!
//! One engine per process. Only one session is active at a time; switching
//! sessions rebinds the graph store and re-primes the hot caches.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{error, info, warn};

use loreweave_core::state::WorldState;
use loreweave_core::{LogBus, LoreweaveError, Result};
use loreweave_harvester::HarvesterHandle;
use loreweave_llm::RoleSet;
use loreweave_memory::MemoryCompressor;
use loreweave_store::{ChatStore, ContextMessage, HotCache, MemoryNode, MessageRecord, RulesStore, SessionRow};
use loreweave_vector::VectorCollection;

const DEFAULT_CHAR_NAME: &str = "AI Character";
const DEFAULT_CHAR_PERSONA: &str = "A helpful roleplay assistant.";

/// The session the orchestrator currently narrates.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub uuid: String,
    pub id: i64,
    pub char_name: String,
    pub char_persona: String,
}

pub struct Engine {
    pub(crate) config: loreweave_core::LoreweaveConfig,
    pub(crate) roles: RoleSet,
    pub(crate) store: Arc<ChatStore>,
    pub(crate) rules: Arc<RulesStore>,
    pub(crate) hot: Arc<HotCache>,
    pub(crate) memory_vec: Arc<VectorCollection>,
    pub(crate) rules_vec: Arc<VectorCollection>,
    pub(crate) graph: Arc<loreweave_graph::GraphStore>,
    pub(crate) harvester: HarvesterHandle,
    pub(crate) compressor: MemoryCompressor,
    pub(crate) bus: LogBus,
    active: RwLock<Option<ActiveSession>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: loreweave_core::LoreweaveConfig,
        roles: RoleSet,
        store: Arc<ChatStore>,
        rules: Arc<RulesStore>,
        hot: Arc<HotCache>,
        memory_vec: Arc<VectorCollection>,
        rules_vec: Arc<VectorCollection>,
        graph: Arc<loreweave_graph::GraphStore>,
        harvester: HarvesterHandle,
        compressor: MemoryCompressor,
        bus: LogBus,
    ) -> Self {
        info!("engine ready");
        Self {
            config,
            roles,
            store,
            rules,
            hot,
            memory_vec,
            rules_vec,
            graph,
            harvester,
            compressor,
            bus,
            active: RwLock::new(None),
        }
    }

    pub fn bus(&self) -> &LogBus {
        &self.bus
    }

    pub fn active_session(&self) -> Option<ActiveSession> {
        self.active.read().unwrap().clone()
    }

    // ── session lifecycle ───────────────────────────────────────────────────

    /// Create a session and make it active. Returns the new UUID.
    pub async fn start_new_session(
        &self,
        user_name: &str,
        char_name: Option<&str>,
        char_persona: Option<&str>,
    ) -> Result<String> {
        let char_name = char_name.unwrap_or(DEFAULT_CHAR_NAME).to_string();
        let char_persona = char_persona.unwrap_or(DEFAULT_CHAR_PERSONA).to_string();

        let initial_state = WorldState::initial(user_name).to_value();
        let uuid = self
            .store
            .create_session(&char_name, &initial_state)
            .map_err(db_err)?;
        let row = self
            .store
            .session(&uuid)
            .map_err(db_err)?
            .ok_or_else(|| LoreweaveError::SessionNotFound { uuid: uuid.clone() })?;

        self.graph.switch_session(&uuid);
        self.hot.clear_context(&uuid).await;
        self.hot.clear_state(&uuid).await;

        *self.active.write().unwrap() = Some(ActiveSession {
            uuid: uuid.clone(),
            id: row.id,
            char_name: char_name.clone(),
            char_persona,
        });
        info!(%uuid, user = user_name, character = %char_name, "new session started");
        Ok(uuid)
    }

    /// Load an existing session and re-prime the hot caches.
    pub async fn load_session(&self, uuid: &str) -> Result<()> {
        let row = self
            .store
            .session(uuid)
            .map_err(db_err)?
            .ok_or_else(|| LoreweaveError::SessionNotFound {
                uuid: uuid.to_string(),
            })?;

        self.graph.switch_session(uuid);
        *self.active.write().unwrap() = Some(ActiveSession {
            uuid: row.uuid.clone(),
            id: row.id,
            char_name: row.character_name.clone(),
            char_persona: DEFAULT_CHAR_PERSONA.to_string(),
        });

        // warm the caches so the first turn reads hot
        let _ = self.history_list(&row.uuid, row.id).await;
        let _ = self.current_state(&row.uuid, row.id).await;
        info!(%uuid, character = %row.character_name, "session loaded");
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        self.store.list_sessions().map_err(db_err)
    }

    /// Destroy a session everywhere: rows, vectors, graph files, caches.
    pub async fn delete_session(&self, uuid: &str) -> Result<bool> {
        warn!(%uuid, "destroying session");
        if !self.store.delete_session(uuid).map_err(db_err)? {
            return Ok(false);
        }

        if let Err(e) = self.memory_vec.delete_session(uuid) {
            error!(err = %e, "session vector cleanup failed");
        }
        self.graph.delete_graph(uuid);
        self.hot.clear_context(uuid).await;
        self.hot.clear_state(uuid).await;

        let mut active = self.active.write().unwrap();
        if active.as_ref().map(|a| a.uuid.as_str()) == Some(uuid) {
            *active = None;
        }
        info!(%uuid, "session destroyed");
        Ok(true)
    }

    // ── cached reads ────────────────────────────────────────────────────────

    /// Recent context window: hot cache first, relational store on miss.
    pub async fn history_list(&self, uuid: &str, session_id: i64) -> Vec<ContextMessage> {
        if let Some(cached) = self.hot.context(uuid).await {
            return cached;
        }
        let history = match self.store.recent_messages(session_id, self.config.history_limit) {
            Ok(msgs) => msgs
                .into_iter()
                .map(|m| ContextMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                error!(err = %e, "history read failed");
                return Vec::new();
            }
        };
        self.hot.cache_context(uuid, &history).await;
        history
    }

    /// Current normalised world state: hot cache first, store on miss.
    pub async fn current_state(&self, uuid: &str, session_id: i64) -> WorldState {
        if let Some(cached) = self.hot.state(uuid).await {
            return WorldState::normalize(cached);
        }
        let raw = match self.store.current_state(session_id) {
            Ok(v) => v,
            Err(e) => {
                error!(err = %e, "state read failed");
                Value::Object(Default::default())
            }
        };
        let state = WorldState::normalize(raw);
        self.hot.cache_state(uuid, &state.to_value()).await;
        state
    }

    // ── rollback & inspection ───────────────────────────────────────────────

    /// Rewind the active session to `message_id`: restore the snapshot,
    /// drop later rows, rebuild the hot caches.
    pub async fn rollback(&self, target_message_id: i64) -> Result<()> {
        let active = self
            .active_session()
            .ok_or(LoreweaveError::NoActiveSession)?;
        warn!(target_message_id, "rolling back");

        let restored = self
            .store
            .rollback_to_message(active.id, target_message_id)
            .map_err(db_err)?;

        self.hot.clear_context(&active.uuid).await;
        self.hot.clear_state(&active.uuid).await;
        self.hot.cache_state(&active.uuid, &restored).await;
        let _ = self.history_list(&active.uuid, active.id).await;

        info!(target_message_id, "rollback complete");
        Ok(())
    }

    pub fn full_history(&self, page: usize, page_size: usize) -> Result<Vec<MessageRecord>> {
        let active = self
            .active_session()
            .ok_or(LoreweaveError::NoActiveSession)?;
        self.store
            .full_history(active.id, page, page_size)
            .map_err(db_err)
    }

    pub fn archived_memories(&self, limit: usize) -> Result<Vec<MemoryNode>> {
        let active = self
            .active_session()
            .ok_or(LoreweaveError::NoActiveSession)?;
        self.store.memories(active.id, limit).map_err(db_err)
    }

    /// Snapshot for monitors: active session, sizes, queue depth.
    pub fn status_snapshot(&self) -> Value {
        let active = self.active_session();
        let message_count = active
            .as_ref()
            .and_then(|a| self.store.message_count(a.id).ok())
            .unwrap_or(0);
        let graph_stats = self.graph.stats();
        serde_json::json!({
            "session": active.as_ref().map(|a| a.uuid.clone()),
            "character": active.as_ref().map(|a| a.char_name.clone()),
            "message_count": message_count,
            "pending_harvest_tasks": self.harvester.pending(),
            "graph": {
                "nodes": graph_stats.nodes,
                "edges": graph_stats.edges,
                "aliases": graph_stats.aliases,
            },
            "hot_cache": self.hot.enabled(),
        })
    }

    /// Flush durable state on shutdown or session switch.
    pub fn shutdown(&self) {
        self.graph.flush();
        info!("engine shut down");
    }
}

pub(crate) fn db_err(e: loreweave_store::StoreError) -> LoreweaveError {
    LoreweaveError::Database(e.to_string())
}
