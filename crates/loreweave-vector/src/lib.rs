pub mod embed;
pub mod error;
pub mod store;

pub use embed::{cosine_similarity, Embedder, RemoteEmbedder, RemoteReranker, RerankResult, Reranker};
pub use error::{Result, VectorError};
pub use store::{ScoredRecord, SearchFilter, VectorCollection, VectorDb};

/// Collection holding per-session episodic memories and internet lore.
pub const LONG_TERM_MEMORY: &str = "long_term_memory";
/// Collection co-indexing the rule-preset fragments.
pub const RULES_MEMORY: &str = "rules_memory";
