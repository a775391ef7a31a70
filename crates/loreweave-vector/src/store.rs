//! Persistent vector store with two named collections.
//!
//! Records live in a SQLite table (embedding serialised as JSON); queries
//! embed the search text, score candidates by cosine in-process, then hand
//! the survivors to the reranker. Both capabilities are optional: without an
//! embedder a search is an empty result, not an error.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::embed::{cosine_similarity, Embedder, Reranker};
use crate::error::Result;

/// Shared handle to the vector database file.
#[derive(Clone)]
pub struct VectorDb {
    conn: Arc<Mutex<Connection>>,
}

impl VectorDb {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vector_records (
                id         TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                text       TEXT NOT NULL,
                metadata   TEXT NOT NULL DEFAULT '{}',
                embedding  TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vec_collection
                ON vector_records(collection);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// Bind a named collection to this database.
    pub fn collection(
        &self,
        name: &str,
        embedder: Option<Arc<dyn Embedder>>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> VectorCollection {
        VectorCollection {
            db: self.clone(),
            name: name.to_string(),
            embedder,
            reranker,
        }
    }
}

/// Metadata predicate applied before scoring.
#[derive(Debug, Clone)]
pub enum SearchFilter {
    Any,
    /// Episodic memories of one session, plus global internet lore.
    SessionOrInternetLore { session_id: String },
}

impl SearchFilter {
    fn matches(&self, metadata: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::SessionOrInternetLore { session_id } => {
                let is_session = metadata
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(|s| s == session_id)
                    .unwrap_or(false);
                let is_lore = metadata
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|t| t == "INTERNET_LORE")
                    .unwrap_or(false);
                is_session || is_lore
            }
        }
    }
}

/// One search hit, already reranked.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub id: String,
    pub content: String,
    pub metadata: Value,
    pub score: f32,
}

pub struct VectorCollection {
    db: VectorDb,
    name: String,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl VectorCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace a record, embedding the text first.
    pub async fn add(&self, text: &str, metadata: Value, id: &str) -> Result<()> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or(crate::error::VectorError::NoEmbedder)?;
        let mut vectors = embedder.embed(&[text.to_string()]).await?;
        let embedding = vectors.pop().unwrap_or_default();

        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO vector_records
             (id, collection, text, metadata, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                self.name,
                text,
                serde_json::to_string(&metadata)?,
                serde_json::to_string(&embedding)?,
                now
            ],
        )?;
        debug!(collection = %self.name, id, "vector record stored");
        Ok(())
    }

    /// Two-stage retrieval: cosine coarse ranking, then rerank.
    ///
    /// Without an embedder this is an empty result. A rerank failure falls
    /// back to zero scores (the original two-stage contract) rather than
    /// erroring; an absent reranker keeps the cosine scores.
    pub async fn search(
        &self,
        query: &str,
        n_results: usize,
        filter: &SearchFilter,
    ) -> Vec<ScoredRecord> {
        let Some(embedder) = self.embedder.as_ref() else {
            warn!(collection = %self.name, "no embedder, returning empty search result");
            return Vec::new();
        };

        let query_vec = match embedder.embed(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.remove(0),
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!(collection = %self.name, err = %e, "query embedding failed");
                return Vec::new();
            }
        };

        let rows = match self.load_rows() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(collection = %self.name, err = %e, "vector row scan failed");
                return Vec::new();
            }
        };

        // coarse cosine ranking
        let mut scored: Vec<(RawRecord, f32)> = rows
            .into_iter()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| {
                let sim = cosine_similarity(&query_vec, &r.embedding);
                (r, sim)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n_results);

        if scored.is_empty() {
            return Vec::new();
        }

        // rerank pass
        let documents: Vec<String> = scored.iter().map(|(r, _)| r.text.clone()).collect();
        let rescored: Vec<(usize, f32)> = match &self.reranker {
            Some(reranker) => match reranker.rerank(query, &documents).await {
                Ok(results) => results
                    .into_iter()
                    .map(|r| (r.index, r.relevance_score))
                    .collect(),
                Err(e) => {
                    warn!(err = %e, "rerank failed, falling back to zero scores");
                    (0..documents.len()).map(|i| (i, 0.0)).collect()
                }
            },
            None => scored.iter().enumerate().map(|(i, (_, s))| (i, *s)).collect(),
        };

        let mut results: Vec<ScoredRecord> = rescored
            .into_iter()
            .filter_map(|(idx, score)| {
                let (record, _) = scored.get(idx)?;
                Some(ScoredRecord {
                    id: record.id.clone(),
                    content: self.format_content(record),
                    metadata: record.metadata.clone(),
                    score,
                })
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Existence probe, used for dedup before expensive writes.
    pub fn exists(&self, id: &str) -> bool {
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM vector_records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![self.name, id],
            |_| Ok(()),
        )
        .is_ok()
    }

    /// Drop every record bound to a session. Lore records carry no
    /// session_id and survive.
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        let conn = self.db.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM vector_records
             WHERE collection = ?1 AND json_extract(metadata, '$.session_id') = ?2",
            rusqlite::params![self.name, session_id],
        )?;
        if n > 0 {
            info!(collection = %self.name, session_id, deleted = n, "session vectors removed");
        }
        Ok(n)
    }

    /// Episodic memories get a timeline prefix so the director sees when
    /// the event happened; other collections return raw text.
    fn format_content(&self, record: &RawRecord) -> String {
        if self.name == crate::LONG_TERM_MEMORY {
            if let Some(timeline) = record.metadata.get("timeline").and_then(Value::as_str) {
                return format!("[{timeline}] {}", record.text);
            }
            if let Some(keyword) = record.metadata.get("keyword").and_then(Value::as_str) {
                return format!("[百科:{keyword}] {}", record.text);
            }
        }
        record.text.clone()
    }

    fn load_rows(&self) -> Result<Vec<RawRecord>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, text, metadata, embedding FROM vector_records WHERE collection = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![self.name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|(id, text, metadata, embedding)| RawRecord {
                id,
                text,
                metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
                embedding: serde_json::from_str(&embedding).unwrap_or_default(),
            })
            .collect())
    }
}

struct RawRecord {
    id: String,
    text: String,
    metadata: Value,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// Deterministic fake: maps known words onto fixed unit vectors.
    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs
                .iter()
                .map(|s| {
                    if s.contains("sword") {
                        vec![1.0, 0.0, 0.0]
                    } else if s.contains("dragon") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn collection() -> VectorCollection {
        let db = VectorDb::new(Connection::open_in_memory().unwrap()).unwrap();
        db.collection(crate::LONG_TERM_MEMORY, Some(Arc::new(WordEmbedder)), None)
    }

    #[tokio::test]
    async fn add_search_and_filter() {
        let col = collection();
        col.add(
            "Alice found a sword",
            json!({"type": "episodic", "session_id": "s1", "timeline": "Day 1, 08:00"}),
            "m1",
        )
        .await
        .unwrap();
        col.add(
            "A dragon was sighted",
            json!({"type": "episodic", "session_id": "s2"}),
            "m2",
        )
        .await
        .unwrap();
        col.add(
            "Dragons breathe fire",
            json!({"type": "INTERNET_LORE", "keyword": "dragon"}),
            "lore1",
        )
        .await
        .unwrap();

        let hits = col
            .search(
                "sword",
                10,
                &SearchFilter::SessionOrInternetLore {
                    session_id: "s1".into(),
                },
            )
            .await;
        // s2's record is filtered out; s1 memory + global lore remain
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "m1");
        assert_eq!(hits[0].content, "[Day 1, 08:00] Alice found a sword");

        let hits = col.search("dragon", 10, &SearchFilter::Any).await;
        assert_eq!(hits[0].metadata["type"], "INTERNET_LORE");
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let col = collection();
        col.add("first text", json!({"session_id": "s1"}), "same-id")
            .await
            .unwrap();
        col.add("second text", json!({"session_id": "s1"}), "same-id")
            .await
            .unwrap();
        assert!(col.exists("same-id"));

        let hits = col.search("anything", 10, &SearchFilter::Any).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "second text");
    }

    #[tokio::test]
    async fn delete_session_spares_lore() {
        let col = collection();
        col.add("episodic", json!({"session_id": "s1"}), "m1")
            .await
            .unwrap();
        col.add("lore", json!({"type": "INTERNET_LORE"}), "l1")
            .await
            .unwrap();

        let deleted = col.delete_session("s1").unwrap();
        assert_eq!(deleted, 1);
        assert!(!col.exists("m1"));
        assert!(col.exists("l1"));
    }

    #[tokio::test]
    async fn no_embedder_means_empty_search() {
        let db = VectorDb::new(Connection::open_in_memory().unwrap()).unwrap();
        let col = db.collection(crate::RULES_MEMORY, None, None);
        assert!(col.search("anything", 5, &SearchFilter::Any).await.is_empty());
        assert!(col
            .add("text", json!({}), "id1")
            .await
            .is_err());
    }
}
