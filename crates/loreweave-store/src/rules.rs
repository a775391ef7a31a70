use std::sync::Mutex;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::init_rules_db;
use crate::error::Result;

/// One preset rule fragment. Rules are global — they do not belong to a
/// session — and are co-indexed by the `rules_memory` vector collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFragment {
    pub id: i64,
    pub content: String,
    pub raw_content: String,
    pub category: String,
    pub scope_type: String,
    pub scope_value: String,
    pub tags: String,
    pub summary: String,
    pub source: String,
    pub is_active: bool,
}

/// Read-mostly store over the rule-preset database.
pub struct RulesStore {
    db: Mutex<Connection>,
}

impl RulesStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_rules_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// Rules enabled unconditionally for every turn.
    pub fn active_rules(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT content FROM rule_fragments WHERE is_active = 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// First rule whose scope value or summary mentions the keyword.
    pub fn rule_by_keyword(&self, keyword: &str) -> Result<Option<String>> {
        let pattern = format!("%{keyword}%");
        let db = self.db.lock().unwrap();
        for column in ["scope_value", "summary"] {
            let found: Option<String> = db
                .query_row(
                    &format!("SELECT content FROM rule_fragments WHERE {column} LIKE ?1 LIMIT 1"),
                    rusqlite::params![pattern],
                    |row| row.get(0),
                )
                .ok();
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    pub fn random_rule(&self, category: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                "SELECT content FROM rule_fragments WHERE category = ?1 ORDER BY RANDOM() LIMIT 1",
                rusqlite::params![category],
                |row| row.get(0),
            )
            .ok())
    }

    /// Every distinct non-empty scope value.
    pub fn all_keywords(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT DISTINCT scope_value FROM rule_fragments
             WHERE scope_value IS NOT NULL AND scope_value != ''",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Rules triggered by the current situation: location-scoped rules,
    /// low-HP rules, and any rule tagged with one of the scene tags.
    pub fn context_rules(&self, location: &str, hp: i64, tags: &[String]) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut rules = Vec::new();

        if !location.is_empty() {
            let mut stmt = db.prepare(
                "SELECT content FROM rule_fragments
                 WHERE scope_type = 'LOCATION' AND scope_value = ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![location], |row| row.get::<_, String>(0))?;
            rules.extend(rows.filter_map(|r| r.ok()));
        }

        if hp < 20 {
            let mut stmt = db.prepare(
                "SELECT content FROM rule_fragments
                 WHERE scope_type = 'STATE' AND scope_value = 'LOW_HP'",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rules.extend(rows.filter_map(|r| r.ok()));
        }

        for tag in tags {
            let pattern = format!("%{tag}%");
            let mut stmt =
                db.prepare("SELECT content FROM rule_fragments WHERE tags LIKE ?1")?;
            let rows = stmt.query_map(rusqlite::params![pattern], |row| row.get::<_, String>(0))?;
            rules.extend(rows.filter_map(|r| r.ok()));
        }

        Ok(rules)
    }

    /// Insert a fragment (used by the preset ingest path and tests).
    #[allow(clippy::too_many_arguments)]
    pub fn add_fragment(
        &self,
        content: &str,
        raw_content: &str,
        category: &str,
        scope_type: &str,
        scope_value: &str,
        tags: &str,
        summary: &str,
        source: &str,
        is_active: bool,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO rule_fragments
             (content, raw_content, category, scope_type, scope_value, tags, summary, source, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                content,
                raw_content,
                category,
                scope_type,
                scope_value,
                tags,
                summary,
                source,
                is_active as i64
            ],
        )?;
        Ok(db.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RulesStore {
        let store = RulesStore::new(Connection::open_in_memory().unwrap()).unwrap();
        store
            .add_fragment(
                "Always narrate in second person.",
                "",
                "style",
                "",
                "",
                "",
                "narration voice",
                "preset",
                true,
            )
            .unwrap();
        store
            .add_fragment(
                "The tavern cellar is haunted.",
                "",
                "lore",
                "LOCATION",
                "tavern",
                "spooky",
                "cellar ghosts",
                "preset",
                false,
            )
            .unwrap();
        store
            .add_fragment(
                "Near death, vision blurs.",
                "",
                "mechanic",
                "STATE",
                "LOW_HP",
                "",
                "dying",
                "preset",
                false,
            )
            .unwrap();
        store
    }

    #[test]
    fn active_rules_only() {
        let rules = store().active_rules().unwrap();
        assert_eq!(rules, vec!["Always narrate in second person.".to_string()]);
    }

    #[test]
    fn keyword_lookup_checks_scope_then_summary() {
        let store = store();
        assert_eq!(
            store.rule_by_keyword("tavern").unwrap().unwrap(),
            "The tavern cellar is haunted."
        );
        assert_eq!(
            store.rule_by_keyword("dying").unwrap().unwrap(),
            "Near death, vision blurs."
        );
        assert!(store.rule_by_keyword("dragon").unwrap().is_none());
    }

    #[test]
    fn context_rules_by_location_hp_and_tags() {
        let store = store();
        let rules = store
            .context_rules("tavern", 10, &["spooky".to_string()])
            .unwrap();
        assert_eq!(rules.len(), 3);

        let rules = store.context_rules("forest", 100, &[]).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn keywords_are_distinct() {
        let keywords = store().all_keywords().unwrap();
        assert_eq!(keywords.len(), 2);
        assert!(keywords.contains(&"tavern".to_string()));
        assert!(keywords.contains(&"LOW_HP".to_string()));
    }
}
