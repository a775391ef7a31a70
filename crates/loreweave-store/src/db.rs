use rusqlite::Connection;

use crate::error::Result;

/// Initialise the main chat tables. Safe to call on every startup
/// (idempotent — `IF NOT EXISTS` throughout).
pub fn init_chat_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid            TEXT NOT NULL UNIQUE,
            character_name  TEXT NOT NULL,
            last_state_json TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            is_summarized   INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conv
            ON messages(conversation_id, id);

        CREATE TABLE IF NOT EXISTS memory_nodes (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            summary_text    TEXT NOT NULL,
            level           TEXT NOT NULL,
            timeline_tag    TEXT NOT NULL,
            vector_id       TEXT NOT NULL DEFAULT '',
            is_merged       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_conv
            ON memory_nodes(conversation_id, level, is_merged);

        CREATE TABLE IF NOT EXISTS saga_entries (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS world_states (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            message_id      INTEGER,
            state_json      TEXT NOT NULL,
            diff_summary    TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_states_conv
            ON world_states(conversation_id, message_id);

        CREATE TABLE IF NOT EXISTS interaction_logs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            message_id      INTEGER,
            full_prompt     TEXT NOT NULL,
            rag_context     TEXT NOT NULL DEFAULT '',
            model_name      TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS relationships (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            name            TEXT NOT NULL,
            detail_json     TEXT NOT NULL DEFAULT '{}',
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS lore_entries (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            keyword         TEXT NOT NULL,
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Initialise the rule-preset table (separate DB file; read-mostly).
pub fn init_rules_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rule_fragments (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            content     TEXT NOT NULL,
            raw_content TEXT NOT NULL DEFAULT '',
            category    TEXT NOT NULL DEFAULT '',
            scope_type  TEXT NOT NULL DEFAULT '',
            scope_value TEXT NOT NULL DEFAULT '',
            tags        TEXT NOT NULL DEFAULT '',
            summary     TEXT NOT NULL DEFAULT '',
            source      TEXT NOT NULL DEFAULT '',
            is_active   INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_rules_scope
            ON rule_fragments(scope_type, scope_value);",
    )?;
    Ok(())
}
