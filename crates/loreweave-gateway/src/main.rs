use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use loreweave_core::logbus::BusLayer;
use loreweave_core::{LogBus, LoreweaveConfig};
use loreweave_engine::Engine;
use loreweave_harvester::Harvester;
use loreweave_llm::RoleSet;
use loreweave_memory::MemoryCompressor;
use loreweave_store::{ChatStore, HotCache, RulesStore};
use loreweave_vector::{Embedder, RemoteEmbedder, RemoteReranker, Reranker, VectorDb};

mod app;
mod http;
mod ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bus = LogBus::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loreweave=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BusLayer::new(bus.clone()))
        .init();

    // config: explicit path via LOREWEAVE_CONFIG, else ./loreweave.json
    let config_path = std::env::var("LOREWEAVE_CONFIG").ok();
    let config = LoreweaveConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        LoreweaveConfig::default()
    });

    std::fs::create_dir_all(&config.data_dir)?;

    // durable stores
    let store = Arc::new(ChatStore::open(&format!("{}/chat_core.db", config.data_dir))?);
    let rules = Arc::new(RulesStore::open(&format!(
        "{}/rules_preset.db",
        config.data_dir
    ))?);
    let hot = Arc::new(HotCache::connect(&config.hot_cache).await);

    // vector capabilities — both optional, everything degrades without them
    let (embedder, reranker): (Option<Arc<dyn Embedder>>, Option<Arc<dyn Reranker>>) =
        match config.vector_provider() {
            Some(p) => (
                Some(Arc::new(RemoteEmbedder::new(
                    p.api_key.clone(),
                    p.base_url.clone(),
                    config.vector.embedding_model.clone(),
                ))),
                Some(Arc::new(RemoteReranker::new(
                    p.api_key.clone(),
                    p.base_url.clone(),
                    config.vector.rerank_model.clone(),
                ))),
            ),
            None => {
                warn!("no vector provider configured, retrieval disabled");
                (None, None)
            }
        };

    let vec_db = VectorDb::open(&format!("{}/vector_store.db", config.data_dir))?;
    let memory_vec = Arc::new(vec_db.collection(
        loreweave_vector::LONG_TERM_MEMORY,
        embedder.clone(),
        reranker.clone(),
    ));
    let rules_vec = Arc::new(vec_db.collection(
        loreweave_vector::RULES_MEMORY,
        embedder.clone(),
        reranker.clone(),
    ));

    let graph = Arc::new(loreweave_graph::GraphStore::new(
        format!("{}/graphs", config.data_dir),
        embedder.clone(),
    )?);

    let roles = RoleSet::from_config(&config);

    // background knowledge harvester
    let (harvester, harvester_handle) = Harvester::new(
        roles.seeker.clone(),
        vec_db.collection(
            loreweave_vector::LONG_TERM_MEMORY,
            embedder.clone(),
            reranker.clone(),
        ),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(harvester.run(shutdown_rx));

    let compressor = MemoryCompressor::new(
        store.clone(),
        Arc::new(vec_db.collection(loreweave_vector::LONG_TERM_MEMORY, embedder, reranker)),
        roles.draft.clone(),
        roles.critic.clone(),
        roles.historian.clone(),
        harvester_handle.clone(),
    );

    let engine = Arc::new(Engine::new(
        config.clone(),
        roles,
        store,
        rules,
        hot,
        memory_vec,
        rules_vec,
        graph,
        harvester_handle,
        compressor,
        bus.clone(),
    ));

    let state = Arc::new(app::AppState::new(engine.clone(), bus));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("loreweave gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // stop the harvester and flush durable state
    let _ = shutdown_tx.send(true);
    engine.shutdown();
    Ok(())
}
