use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::init_chat_db;
use crate::error::{Result, StoreError};
use crate::types::{MemoryLevel, MemoryNode, MessageRecord, SessionRow};

/// Durable store for sessions, messages, world-state snapshots, memory nodes,
/// saga entries and interaction logs.
///
/// Thread-safe: a single SQLite connection behind a `Mutex`. All writes for a
/// turn are serialised through it, which is what gives turn N's rows
/// durability before turn N+1 begins reading.
pub struct ChatStore {
    db: Mutex<Connection>,
}

impl ChatStore {
    /// Wrap an open connection, bootstrapping the schema on first use.
    pub fn new(conn: Connection) -> Result<Self> {
        init_chat_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    // ── sessions ────────────────────────────────────────────────────────────

    /// Create a session with its initial world state. Returns the new UUID.
    pub fn create_session(&self, character_name: &str, initial_state: &Value) -> Result<String> {
        let uuid = Uuid::new_v4().to_string();
        let json_str = serde_json::to_string(initial_state)?;
        let now = chrono::Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (uuid, character_name, last_state_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![uuid, character_name, json_str, now],
        )?;
        info!(%uuid, character = character_name, "session created");
        Ok(uuid)
    }

    /// Retrieve a session by UUID, `None` when it does not exist.
    pub fn session(&self, uuid: &str) -> Result<Option<SessionRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, uuid, character_name, created_at FROM conversations WHERE uuid = ?1",
            rusqlite::params![uuid],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, uuid, character_name, created_at FROM conversations ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Destroy a session and every row it owns. Returns false for an
    /// unknown UUID.
    pub fn delete_session(&self, uuid: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let id: i64 = match db.query_row(
            "SELECT id FROM conversations WHERE uuid = ?1",
            rusqlite::params![uuid],
            |row| row.get(0),
        ) {
            Ok(id) => id,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
            Err(e) => return Err(StoreError::Database(e)),
        };

        for table in [
            "messages",
            "memory_nodes",
            "relationships",
            "saga_entries",
            "lore_entries",
            "interaction_logs",
            "world_states",
        ] {
            db.execute(
                &format!("DELETE FROM {table} WHERE conversation_id = ?1"),
                rusqlite::params![id],
            )?;
        }
        db.execute(
            "DELETE FROM conversations WHERE id = ?1",
            rusqlite::params![id],
        )?;
        warn!(%uuid, "session destroyed");
        Ok(true)
    }

    // ── messages ────────────────────────────────────────────────────────────

    /// Append a message; returns its ordinal id.
    pub fn add_message(&self, session_id: i64, role: &str, content: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id, role, content, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Last `limit` messages in chronological order.
    pub fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, timestamp, is_summarized FROM messages
             WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_message)?;
        let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    /// Earliest messages not yet folded into a MICRO summary.
    pub fn unsummarized_messages(&self, session_id: i64, limit: usize) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, timestamp, is_summarized FROM messages
             WHERE conversation_id = ?1 AND is_summarized = 0 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Flag a compression window as consumed — one statement, all ids.
    pub fn mark_messages_summarized(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let db = self.db.lock().unwrap();
        db.execute(
            &format!("UPDATE messages SET is_summarized = 1 WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(ids.iter()),
        )?;
        Ok(())
    }

    /// Paged full history, oldest first. Pages are 1-based.
    pub fn full_history(
        &self,
        session_id: i64,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<MessageRecord>> {
        let offset = page.saturating_sub(1) * page_size;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, timestamp, is_summarized FROM messages
             WHERE conversation_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![session_id, page_size as i64, offset as i64],
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn message_count(&self, session_id: i64) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            rusqlite::params![session_id],
            |row| row.get(0),
        )?)
    }

    // ── world state ─────────────────────────────────────────────────────────

    /// The raw stored state blob. Callers normalise it before use.
    pub fn current_state(&self, session_id: i64) -> Result<Value> {
        let db = self.db.lock().unwrap();
        let json_str: String = db.query_row(
            "SELECT last_state_json FROM conversations WHERE id = ?1",
            rusqlite::params![session_id],
            |row| row.get(0),
        )?;
        Ok(serde_json::from_str(&json_str).unwrap_or_else(|_| Value::Object(Default::default())))
    }

    /// Persist the current state and append a snapshot row for rollback.
    pub fn save_state(
        &self,
        session_id: i64,
        state: &Value,
        diff_summary: &str,
        message_id: Option<i64>,
    ) -> Result<()> {
        let json_str = serde_json::to_string(state)?;
        let now = chrono::Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET last_state_json = ?1 WHERE id = ?2",
            rusqlite::params![json_str, session_id],
        )?;
        db.execute(
            "INSERT INTO world_states (conversation_id, message_id, state_json, diff_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![session_id, message_id, json_str, diff_summary, now],
        )?;
        Ok(())
    }

    /// Restore the latest snapshot at or before `target_message_id` and drop
    /// everything after it. Returns the restored state blob.
    pub fn rollback_to_message(&self, session_id: i64, target_message_id: i64) -> Result<Value> {
        let db = self.db.lock().unwrap();
        let json_str: String = match db.query_row(
            "SELECT state_json FROM world_states
             WHERE conversation_id = ?1 AND message_id IS NOT NULL AND message_id <= ?2
             ORDER BY message_id DESC LIMIT 1",
            rusqlite::params![session_id, target_message_id],
            |row| row.get(0),
        ) {
            Ok(s) => s,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::NoSnapshot {
                    message_id: target_message_id,
                })
            }
            Err(e) => return Err(StoreError::Database(e)),
        };

        db.execute(
            "UPDATE conversations SET last_state_json = ?1 WHERE id = ?2",
            rusqlite::params![json_str, session_id],
        )?;
        db.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND id > ?2",
            rusqlite::params![session_id, target_message_id],
        )?;
        db.execute(
            "DELETE FROM world_states WHERE conversation_id = ?1 AND message_id > ?2",
            rusqlite::params![session_id, target_message_id],
        )?;

        debug!(session_id, target_message_id, "rolled back");
        Ok(serde_json::from_str(&json_str)?)
    }

    // ── memory nodes ────────────────────────────────────────────────────────

    pub fn add_memory_node(
        &self,
        session_id: i64,
        text: &str,
        level: MemoryLevel,
        timeline_tag: &str,
        vector_id: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memory_nodes
             (conversation_id, summary_text, level, timeline_tag, vector_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![session_id, text, level.to_string(), timeline_tag, vector_id, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// MICRO nodes not yet merged into a MACRO, oldest first.
    pub fn unmerged_micro_nodes(&self, session_id: i64, limit: usize) -> Result<Vec<MemoryNode>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, summary_text, level, timeline_tag, vector_id, is_merged, created_at
             FROM memory_nodes
             WHERE conversation_id = ?1 AND level = 'MICRO' AND is_merged = 0
             ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_nodes_merged(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let db = self.db.lock().unwrap();
        db.execute(
            &format!("UPDATE memory_nodes SET is_merged = 1 WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(ids.iter()),
        )?;
        Ok(())
    }

    /// Long-term context for the director: every MACRO, then every un-merged
    /// MICRO, in insertion order.
    pub fn memory_spine(&self, session_id: i64) -> Result<String> {
        let db = self.db.lock().unwrap();
        let mut spine = String::new();

        let mut stmt = db.prepare(
            "SELECT timeline_tag, summary_text FROM memory_nodes
             WHERE conversation_id = ?1 AND level = 'MACRO' ORDER BY id ASC",
        )?;
        let macros = stmt.query_map(rusqlite::params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for r in macros.filter_map(|r| r.ok()) {
            spine.push_str(&format!("[Macro|{}] {}\n", r.0, r.1));
        }

        let mut stmt = db.prepare(
            "SELECT timeline_tag, summary_text FROM memory_nodes
             WHERE conversation_id = ?1 AND level = 'MICRO' AND is_merged = 0 ORDER BY id ASC",
        )?;
        let micros = stmt.query_map(rusqlite::params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for r in micros.filter_map(|r| r.ok()) {
            spine.push_str(&format!("[Micro|{}] {}\n", r.0, r.1));
        }

        if spine.is_empty() {
            spine.push_str("No history yet.");
        }
        Ok(spine)
    }

    /// Newest-first memory listing for inspection endpoints.
    pub fn memories(&self, session_id: i64, limit: usize) -> Result<Vec<MemoryNode>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, summary_text, level, timeline_tag, vector_id, is_merged, created_at
             FROM memory_nodes WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── saga & logs ─────────────────────────────────────────────────────────

    pub fn add_saga_entry(&self, session_id: i64, content: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO saga_entries (conversation_id, content, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![session_id, content, now],
        )?;
        Ok(())
    }

    pub fn saga_count(&self, session_id: i64) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM saga_entries WHERE conversation_id = ?1",
            rusqlite::params![session_id],
            |row| row.get(0),
        )?)
    }

    /// Audit row tying the assistant message to the exact prompt and
    /// retrieval context that produced it.
    pub fn log_interaction(
        &self,
        session_id: i64,
        message_id: i64,
        full_prompt: &str,
        rag_context: &str,
        model_name: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO interaction_logs
             (conversation_id, message_id, full_prompt, rag_context, model_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![session_id, message_id, full_prompt, rag_context, model_name, now],
        )?;
        Ok(())
    }

    pub fn snapshot_count(&self, session_id: i64) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM world_states WHERE conversation_id = ?1",
            rusqlite::params![session_id],
            |row| row.get(0),
        )?)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        uuid: row.get(1)?,
        character_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        role: row.get(1)?,
        content: row.get(2)?,
        timestamp: row.get(3)?,
        is_summarized: row.get::<_, i64>(4)? != 0,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNode> {
    let level_str: String = row.get(2)?;
    Ok(MemoryNode {
        id: row.get(0)?,
        summary_text: row.get(1)?,
        level: level_str.parse().unwrap_or(MemoryLevel::Micro),
        timeline_tag: row.get(3)?,
        vector_id: row.get(4)?,
        is_merged: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ChatStore {
        ChatStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn new_session(store: &ChatStore) -> (String, i64) {
        let uuid = store
            .create_session("Bob", &json!({"player": {"name": "Alice"}}))
            .unwrap();
        let id = store.session(&uuid).unwrap().unwrap().id;
        (uuid, id)
    }

    #[test]
    fn create_and_load_session() {
        let store = store();
        let (uuid, id) = new_session(&store);
        let row = store.session(&uuid).unwrap().unwrap();
        assert_eq!(row.character_name, "Bob");
        assert_eq!(row.id, id);
        assert!(store.session("no-such-uuid").unwrap().is_none());
    }

    #[test]
    fn messages_keep_insertion_order() {
        let store = store();
        let (_, id) = new_session(&store);
        let m1 = store.add_message(id, "user", "one").unwrap();
        let m2 = store.add_message(id, "assistant", "two").unwrap();
        assert!(m2 > m1);

        let recent = store.recent_messages(id, 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "one");
        assert_eq!(recent[1].role, "assistant");

        let recent = store.recent_messages(id, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "two");
    }

    #[test]
    fn summarize_window_marks_atomically() {
        let store = store();
        let (_, id) = new_session(&store);
        for i in 0..6 {
            store.add_message(id, "user", &format!("m{i}")).unwrap();
        }
        let window = store.unsummarized_messages(id, 5).unwrap();
        assert_eq!(window.len(), 5);
        let ids: Vec<i64> = window.iter().map(|m| m.id).collect();
        store.mark_messages_summarized(&ids).unwrap();

        let rest = store.unsummarized_messages(id, 5).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content, "m5");
    }

    #[test]
    fn state_round_trips_and_snapshots() {
        let store = store();
        let (_, id) = new_session(&store);
        let state = json!({"player": {"name": "Alice", "hp": 80}, "skills": {}});
        store.save_state(id, &state, "hp drop", Some(2)).unwrap();

        let loaded = store.current_state(id).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.snapshot_count(id).unwrap(), 1);
    }

    #[test]
    fn rollback_restores_state_and_trims_log() {
        let store = store();
        let (_, id) = new_session(&store);

        // three turns: messages (1,2) (3,4) (5,6), snapshot after each
        for turn in 0..3 {
            store.add_message(id, "user", &format!("u{turn}")).unwrap();
            let aid = store
                .add_message(id, "assistant", &format!("a{turn}"))
                .unwrap();
            store
                .save_state(id, &json!({"turn": turn}), "", Some(aid))
                .unwrap();
        }

        let restored = store.rollback_to_message(id, 2).unwrap();
        assert_eq!(restored, json!({"turn": 0}));
        assert_eq!(store.message_count(id).unwrap(), 2);
        assert_eq!(store.current_state(id).unwrap(), json!({"turn": 0}));
        // only the turn-1 snapshot survives
        assert_eq!(store.snapshot_count(id).unwrap(), 1);
    }

    #[test]
    fn rollback_without_snapshot_errors() {
        let store = store();
        let (_, id) = new_session(&store);
        store.add_message(id, "user", "hi").unwrap();
        assert!(matches!(
            store.rollback_to_message(id, 1),
            Err(StoreError::NoSnapshot { .. })
        ));
    }

    #[test]
    fn spine_lists_macros_then_unmerged_micros() {
        let store = store();
        let (_, id) = new_session(&store);
        assert_eq!(store.memory_spine(id).unwrap(), "No history yet.");

        store
            .add_memory_node(id, "micro one", MemoryLevel::Micro, "Day 1, 08:00", "v1")
            .unwrap();
        let merged = store
            .add_memory_node(id, "micro two", MemoryLevel::Micro, "Day 1, 09:00", "v2")
            .unwrap();
        store
            .add_memory_node(id, "the arc so far", MemoryLevel::Macro, "Day 1, 08:00", "v3")
            .unwrap();
        store.mark_nodes_merged(&[merged]).unwrap();

        let spine = store.memory_spine(id).unwrap();
        assert_eq!(
            spine,
            "[Macro|Day 1, 08:00] the arc so far\n[Micro|Day 1, 08:00] micro one\n"
        );
    }

    #[test]
    fn unmerged_micro_window() {
        let store = store();
        let (_, id) = new_session(&store);
        for i in 0..12 {
            store
                .add_memory_node(
                    id,
                    &format!("micro {i}"),
                    MemoryLevel::Micro,
                    "Day 1, 08:00",
                    "",
                )
                .unwrap();
        }
        let window = store.unmerged_micro_nodes(id, 10).unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].summary_text, "micro 0");
    }

    #[test]
    fn delete_session_cascades() {
        let store = store();
        let (uuid, id) = new_session(&store);
        store.add_message(id, "user", "hi").unwrap();
        store
            .add_memory_node(id, "m", MemoryLevel::Micro, "Day 1, 08:00", "")
            .unwrap();
        store.add_saga_entry(id, "chapter").unwrap();

        assert!(store.delete_session(&uuid).unwrap());
        assert!(store.session(&uuid).unwrap().is_none());
        assert_eq!(store.message_count(id).unwrap(), 0);
        assert_eq!(store.saga_count(id).unwrap(), 0);
        assert!(!store.delete_session(&uuid).unwrap());
    }

    #[test]
    fn paged_history() {
        let store = store();
        let (_, id) = new_session(&store);
        for i in 0..25 {
            store.add_message(id, "user", &format!("m{i}")).unwrap();
        }
        let page1 = store.full_history(id, 1, 10).unwrap();
        let page3 = store.full_history(id, 3, 10).unwrap();
        assert_eq!(page1.len(), 10);
        assert_eq!(page1[0].content, "m0");
        assert_eq!(page3.len(), 5);
        assert_eq!(page3[4].content, "m24");
    }
}
