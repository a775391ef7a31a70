//! End-to-end turn tests with scripted providers: stream shape, persistence
//! invariants, state advancement, rollback, and failure paths.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use loreweave_core::{LogBus, LoreweaveConfig};
use loreweave_engine::{ChatOptions, Engine};
use loreweave_harvester::Harvester;
use loreweave_llm::provider::{ChatRequest, LlmProvider, ProviderError};
use loreweave_llm::{RoleClient, RoleSet};
use loreweave_memory::MemoryCompressor;
use loreweave_store::{ChatStore, HotCache, RulesStore};
use loreweave_vector::VectorDb;

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

/// Reflex that answers the retrieval-query prompt and the rule-selection
/// prompt differently.
struct ScriptedReflex(&'static str);

#[async_trait]
impl LlmProvider for ScriptedReflex {
    fn name(&self) -> &str {
        "reflex"
    }
    async fn generate(&self, req: &ChatRequest) -> Result<String, ProviderError> {
        if req.messages[0].content.contains("Which rules apply") {
            Ok("NONE".to_string())
        } else {
            Ok(self.0.to_string())
        }
    }
}

/// Extractor/sociologist double: emits triples for the extraction prompt,
/// plain prose otherwise.
struct ScriptedObserver;

#[async_trait]
impl LlmProvider for ScriptedObserver {
    fn name(&self) -> &str {
        "observer"
    }
    async fn generate(&self, req: &ChatRequest) -> Result<String, ProviderError> {
        if req.messages[0].content.contains("Knowledge Graph Extractor") {
            Ok(r#"{"triplets": [{"source": "Alice", "relation": "visits", "target": "Tavern", "desc": "first night"}]}"#
                .to_string())
        } else {
            Ok("the power balance shifts slightly".to_string())
        }
    }
}

struct Failing;

#[async_trait]
impl LlmProvider for Failing {
    fn name(&self) -> &str {
        "failing"
    }
    async fn generate(&self, _req: &ChatRequest) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("down".into()))
    }
}

const LONG_REPLY: &str = "The tavern falls silent as you speak. Bob studies you from across the bar, \
then slides a tarnished key over the counter without a word.";

struct Fixture {
    engine: Arc<Engine>,
    store: Arc<ChatStore>,
    graph: Arc<loreweave_graph::GraphStore>,
    _tmp: tempfile::TempDir,
}

fn build_engine(
    status: Arc<dyn LlmProvider>,
    narrator: Arc<dyn LlmProvider>,
    reflex: Arc<dyn LlmProvider>,
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();

    let store = Arc::new(ChatStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
    let rules = Arc::new(RulesStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
    let hot = Arc::new(HotCache::disabled());

    let vec_db = VectorDb::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap();
    let memory_vec = Arc::new(vec_db.collection(loreweave_vector::LONG_TERM_MEMORY, None, None));
    let rules_vec = Arc::new(vec_db.collection(loreweave_vector::RULES_MEMORY, None, None));

    let graph = Arc::new(loreweave_graph::GraphStore::new(tmp.path(), None).unwrap());

    let seeker = RoleClient::with_provider("seeker", Arc::new(Scripted("lore")));
    let lore = vec_db.collection(loreweave_vector::LONG_TERM_MEMORY, None, None);
    let (_harvester, handle) = Harvester::new(seeker, lore);

    let compressor = MemoryCompressor::new(
        store.clone(),
        Arc::new(vec_db.collection(loreweave_vector::LONG_TERM_MEMORY, None, None)),
        RoleClient::with_provider("draft", Arc::new(Scripted("draft summary"))),
        RoleClient::with_provider("critic", Arc::new(Scripted("final summary"))),
        RoleClient::with_provider("historian", Arc::new(Scripted("chapter"))),
        handle.clone(),
    );

    let roles = RoleSet {
        reflex: RoleClient::with_provider("reflex", reflex),
        director: RoleClient::with_provider("director", Arc::new(Scripted("the ghost stirs tonight"))),
        narrator: RoleClient::with_provider("narrator", narrator),
        status: RoleClient::with_provider("status", status),
        draft: RoleClient::with_provider("draft", Arc::new(Scripted("draft summary"))),
        critic: RoleClient::with_provider("critic", Arc::new(Scripted("final summary"))),
        historian: RoleClient::with_provider("historian", Arc::new(Scripted("chapter"))),
        sociologist: RoleClient::with_provider("sociologist", Arc::new(ScriptedObserver)),
        seeker: RoleClient::with_provider("seeker", Arc::new(Scripted("lore"))),
    };

    let engine = Arc::new(Engine::new(
        LoreweaveConfig::default(),
        roles,
        store.clone(),
        rules,
        hot,
        memory_vec,
        rules_vec,
        graph.clone(),
        handle,
        compressor,
        LogBus::new(),
    ));
    Fixture {
        engine,
        store,
        graph,
        _tmp: tmp,
    }
}

fn default_fixture() -> Fixture {
    build_engine(
        Arc::new(Scripted("not json at all")),
        Arc::new(Scripted(LONG_REPLY)),
        Arc::new(ScriptedReflex("tavern secrets")),
    )
}

async fn run_turn(f: &Fixture, input: &str, opts: ChatOptions) -> Vec<String> {
    let (tx, mut rx) = mpsc::channel(256);
    let background = f.engine.clone().chat(input, opts, tx).await;
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    if let Some(handle) = background {
        handle.await.unwrap();
    }
    chunks
}

#[tokio::test]
async fn fresh_session_single_turn() {
    let f = default_fixture();
    let uuid = f
        .engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();

    let chunks = run_turn(&f, "Hello Bob.", ChatOptions::default()).await;
    let joined = chunks.join("");
    assert!(joined.contains("[导演]: the ghost stirs tonight"));
    assert!(joined.contains(LONG_REPLY));

    let active = f.engine.active_session().unwrap();
    let messages = f.store.full_history(active.id, 1, 50).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "Hello Bob.");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, LONG_REPLY);

    assert_eq!(f.store.snapshot_count(active.id).unwrap(), 1);

    // garbage status reply degrades to the ten-minute default advance
    let state = f.engine.current_state(&uuid, active.id).await;
    assert_eq!(state.timeline_tag(), "Day 1, 08:10");
}

#[tokio::test]
async fn rollback_to_mid_conversation() {
    let f = default_fixture();
    let uuid = f
        .engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();

    for i in 0..3 {
        run_turn(&f, &format!("turn {i}"), ChatOptions::default()).await;
    }
    let active = f.engine.active_session().unwrap();
    assert_eq!(f.store.message_count(active.id).unwrap(), 6);

    f.engine.rollback(2).await.unwrap();

    assert_eq!(f.store.message_count(active.id).unwrap(), 2);
    let history = f.engine.history_list(&uuid, active.id).await;
    assert_eq!(history.len(), 2);
    // state equals the turn-1 snapshot: one default advance from 08:00
    let state = f.engine.current_state(&uuid, active.id).await;
    assert_eq!(state.timeline_tag(), "Day 1, 08:10");
}

#[tokio::test]
async fn status_delta_is_deep_merged() {
    let f = build_engine(
        Arc::new(Scripted(
            r#"{"timeline_tag": "Day 1, 09:00", "state": {"player": {"hp": 80}, "world_time": {"day": 1, "hour": 9, "minute": 0}}}"#,
        )),
        Arc::new(Scripted(LONG_REPLY)),
        Arc::new(ScriptedReflex("tavern secrets")),
    );
    let uuid = f
        .engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();
    run_turn(&f, "I drink the strange ale.", ChatOptions::default()).await;

    let active = f.engine.active_session().unwrap();
    let state = f.engine.current_state(&uuid, active.id).await;
    assert_eq!(state.player.hp, 80);
    assert_eq!(state.player.name, "Alice");
    assert_eq!(state.player.max_hp, 100);
    assert_eq!(state.timeline_tag(), "Day 1, 09:00");
}

#[tokio::test]
async fn graph_extraction_runs_after_turn() {
    let f = default_fixture();
    f.engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();
    run_turn(&f, "I ask Bob about the tavern's history.", ChatOptions::default()).await;

    // keyword fallback path: no embedder in tests
    let out = f.graph.search_subgraph("Alice", 5, 1, 0.0).await;
    assert!(out.contains("(Alice) --[visits]--> (Tavern)"));
}

#[tokio::test]
async fn narrator_failure_emits_sentinel_and_persists() {
    let f = build_engine(
        Arc::new(Scripted("not json")),
        Arc::new(Failing),
        Arc::new(ScriptedReflex("tavern secrets")),
    );
    f.engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();

    let chunks = run_turn(&f, "Hello?", ChatOptions::default()).await;
    assert!(chunks.join("").contains("(叙事者故障，请重试)"));

    let active = f.engine.active_session().unwrap();
    let messages = f.store.full_history(active.id, 1, 10).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "(叙事者故障，请重试)");
    assert_eq!(f.store.snapshot_count(active.id).unwrap(), 1);
}

#[tokio::test]
async fn lite_mode_skips_planning() {
    let f = build_engine(
        Arc::new(Scripted("not json")),
        Arc::new(Scripted(LONG_REPLY)),
        // reflex would explode if it were consulted
        Arc::new(Failing),
    );
    f.engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();

    let chunks = run_turn(
        &f,
        "quick one",
        ChatOptions {
            lite_mode: true,
            ..Default::default()
        },
    )
    .await;
    let joined = chunks.join("");
    assert!(!joined.contains("[导演]"));
    assert!(joined.contains(LONG_REPLY));
}

#[tokio::test]
async fn blocked_input_aborts_without_persisting() {
    let f = build_engine(
        Arc::new(Scripted("not json")),
        Arc::new(Scripted(LONG_REPLY)),
        Arc::new(Scripted("BLOCK")),
    );
    f.engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();

    let chunks = run_turn(&f, "something vile", ChatOptions::default()).await;
    assert!(chunks.join("").contains("系统拦截"));

    let active = f.engine.active_session().unwrap();
    assert_eq!(f.store.message_count(active.id).unwrap(), 0);
}

#[tokio::test]
async fn chat_without_session_yields_error_chunk() {
    let f = default_fixture();
    let chunks = run_turn(&f, "anyone there?", ChatOptions::default()).await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].contains("[系统错误]"));
}

#[tokio::test]
async fn micro_compression_fires_on_fifth_message() {
    let f = default_fixture();
    f.engine
        .start_new_session("Alice", Some("Bob"), None)
        .await
        .unwrap();

    // three turns = six messages; the five earliest fold into one micro
    for i in 0..3 {
        run_turn(&f, &format!("turn {i}"), ChatOptions::default()).await;
    }

    let active = f.engine.active_session().unwrap();
    let memories = f.engine.archived_memories(20).unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].summary_text, "final summary");
    // five marked, one left over
    assert_eq!(
        f.store.unsummarized_messages(active.id, 10).unwrap().len(),
        1
    );
}
