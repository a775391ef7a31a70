//! World-state schema and merge rules.
//!
//! The state is a fixed-shape nested document. Partial updates produced by
//! the status LLM are deep-merged: maps recurse, lists are replaced
//! wholesale, scalars overwrite. Reads always normalise the stored blob —
//! missing subtrees are filled from the default template and legacy flat
//! fields from old saves are migrated in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Dawn,
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// Band an hour-of-day into its narrative period.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=6 => Self::Dawn,
            7..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=19 => Self::Evening,
            _ => Self::Night,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldTime {
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl Default for WorldTime {
    fn default() -> Self {
        Self {
            day: 1,
            hour: 8,
            minute: 0,
        }
    }
}

impl WorldTime {
    /// Advance the clock, carrying across hour and day boundaries.
    pub fn advance_minutes(&mut self, minutes: u32) {
        self.minute += minutes;
        self.hour += self.minute / 60;
        self.minute %= 60;
        self.day += self.hour / 24;
        self.hour %= 24;
    }

    /// Human-readable tag, e.g. `"Day 3, 17:05"`.
    pub fn timeline_tag(&self) -> String {
        format!("Day {}, {:02}:{:02}", self.day, self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    #[serde(default = "default_player_name")]
    pub name: String,
    #[serde(default = "default_hp")]
    pub hp: i64,
    #[serde(default = "default_hp")]
    pub max_hp: i64,
    #[serde(default = "default_mp")]
    pub mp: i64,
    #[serde(default = "default_mp")]
    pub max_mp: i64,
    #[serde(default)]
    pub status_effects: Vec<String>,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            name: default_player_name(),
            hp: 100,
            max_hp: 100,
            mp: 50,
            max_mp: 50,
            status_effects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    #[serde(default = "default_level")]
    pub level: i64,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    #[serde(rename = "type", default = "default_item_type")]
    pub kind: String,
    #[serde(default = "default_count")]
    pub count: i64,
    #[serde(default)]
    pub equipped: bool,
    #[serde(default)]
    pub description: String,
}

/// NPC relationship entry. Field names are the prose keys the status LLM
/// emits; the relation itself is free text, not a scalar score.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "关系", default)]
    pub relation: String,
    #[serde(rename = "近期事件", default)]
    pub recent_events: Vec<String>,
    #[serde(rename = "性格备注", default)]
    pub personality_note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub sub_location: String,
    #[serde(default = "default_atmosphere")]
    pub atmosphere: String,
    #[serde(default = "default_weather")]
    pub weather: String,
    #[serde(default = "default_time_of_day")]
    pub time_of_day: TimeOfDay,
    #[serde(default)]
    pub npcs_present: Vec<String>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            location: default_location(),
            sub_location: String::new(),
            atmosphere: default_atmosphere(),
            weather: default_weather(),
            time_of_day: TimeOfDay::Morning,
            npcs_present: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarratorPersona {
    #[serde(default = "default_mood")]
    pub current_mood: String,
    #[serde(default = "default_speech_style")]
    pub speech_style: String,
}

impl Default for NarratorPersona {
    fn default() -> Self {
        Self {
            current_mood: default_mood(),
            speech_style: default_speech_style(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub player: Player,
    #[serde(default)]
    pub skills: BTreeMap<String, Skill>,
    #[serde(default)]
    pub inventory: BTreeMap<String, InventoryItem>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    #[serde(default)]
    pub scene: Scene,
    #[serde(default)]
    pub world_time: WorldTime,
    #[serde(default)]
    pub narrator_persona: NarratorPersona,
}

impl WorldState {
    /// Fresh state for a new session with the given player name.
    pub fn initial(user_name: &str) -> Self {
        let mut state = Self::default();
        state.player.name = user_name.to_string();
        state
    }

    pub fn timeline_tag(&self) -> String {
        self.world_time.timeline_tag()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Rebuild a typed state from an arbitrary stored blob.
    ///
    /// Legacy flat fields are migrated first, then the blob is merged over
    /// the default template so every subtree exists. A blob that still does
    /// not deserialize falls back to the template.
    pub fn normalize(raw: Value) -> Self {
        let migrated = migrate_legacy(raw);
        let mut base = Self::default().to_value();
        deep_merge(&mut base, &migrated);
        match serde_json::from_value(base) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(err = %e, "state blob unreadable, resetting to template");
                Self::default()
            }
        }
    }

    /// Deep-merge a partial update into this state and renormalise.
    pub fn apply_delta(&self, delta: &Value) -> Self {
        let mut base = self.to_value();
        deep_merge(&mut base, delta);
        Self::normalize(base)
    }
}

/// Merge `update` into `base`: objects recurse, arrays replace wholesale,
/// scalars overwrite. Keys absent from `update` are left untouched, so a
/// partial update can never delete a subtree.
pub fn deep_merge(base: &mut Value, update: &Value) {
    match (base, update) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, update_val) in update_map {
                match base_map.get_mut(key) {
                    Some(base_val) if base_val.is_object() && update_val.is_object() => {
                        deep_merge(base_val, update_val);
                    }
                    _ => {
                        base_map.insert(key.clone(), update_val.clone());
                    }
                }
            }
        }
        (base_slot, update_val) => {
            *base_slot = update_val.clone();
        }
    }
}

/// Rewrite pre-schema saves into the current shape:
/// scalar `hp` moves under `player`, a list `inventory` becomes a counted
/// item map, a top-level `location` moves under `scene`, and a string
/// `world_time` resets to the default clock.
fn migrate_legacy(mut raw: Value) -> Value {
    let Some(map) = raw.as_object_mut() else {
        return raw;
    };

    if let Some(hp) = map.get("hp").and_then(Value::as_i64) {
        map.remove("hp");
        let player = map.entry("player").or_insert_with(|| json!({}));
        if let Some(player_map) = player.as_object_mut() {
            player_map.entry("hp").or_insert(json!(hp));
        }
    }

    if let Some(items) = map.get("inventory").and_then(Value::as_array).cloned() {
        let mut inv = serde_json::Map::new();
        for item in items {
            if let Some(name) = item.as_str() {
                inv.insert(name.to_string(), json!({ "type": "item", "count": 1 }));
            }
        }
        map.insert("inventory".to_string(), Value::Object(inv));
    }

    if let Some(location) = map.get("location").and_then(Value::as_str).map(String::from) {
        map.remove("location");
        let scene = map.entry("scene").or_insert_with(|| json!({}));
        if let Some(scene_map) = scene.as_object_mut() {
            scene_map.entry("location").or_insert(json!(location));
        }
    }

    if map.get("world_time").map(Value::is_string).unwrap_or(false) {
        map.insert(
            "world_time".to_string(),
            serde_json::to_value(WorldTime::default()).unwrap_or_default(),
        );
    }

    raw
}

fn default_player_name() -> String {
    "Player".to_string()
}
fn default_hp() -> i64 {
    100
}
fn default_mp() -> i64 {
    50
}
fn default_level() -> i64 {
    1
}
fn default_count() -> i64 {
    1
}
fn default_item_type() -> String {
    "item".to_string()
}
fn default_location() -> String {
    "未知地点".to_string()
}
fn default_atmosphere() -> String {
    "日常".to_string()
}
fn default_weather() -> String {
    "晴朗".to_string()
}
fn default_time_of_day() -> TimeOfDay {
    TimeOfDay::Morning
}
fn default_mood() -> String {
    "平静".to_string()
}
fn default_speech_style() -> String {
    "正常".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_carries_across_hour_and_day() {
        let mut t = WorldTime {
            day: 1,
            hour: 23,
            minute: 55,
        };
        t.advance_minutes(10);
        assert_eq!((t.day, t.hour, t.minute), (2, 0, 5));

        let mut t = WorldTime {
            day: 3,
            hour: 8,
            minute: 50,
        };
        t.advance_minutes(10);
        assert_eq!((t.day, t.hour, t.minute), (3, 9, 0));
    }

    #[test]
    fn clock_stays_in_range_under_large_advance() {
        let mut t = WorldTime::default();
        t.advance_minutes(10_000);
        assert!(t.minute < 60);
        assert!(t.hour < 24);
        assert!(t.day >= 1);
    }

    #[test]
    fn timeline_tag_is_zero_padded() {
        let t = WorldTime {
            day: 2,
            hour: 7,
            minute: 5,
        };
        assert_eq!(t.timeline_tag(), "Day 2, 07:05");
    }

    #[test]
    fn time_of_day_banding() {
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::Dawn);
        assert_eq!(TimeOfDay::from_hour(6), TimeOfDay::Dawn);
        assert_eq!(TimeOfDay::from_hour(7), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(11), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(16), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(17), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(19), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(20), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(0), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(4), TimeOfDay::Night);
    }

    #[test]
    fn deep_merge_recurses_maps_and_replaces_lists() {
        let mut base = json!({
            "player": { "hp": 100, "mp": 50, "status_effects": ["poisoned", "tired"] },
            "scene": { "location": "tavern" }
        });
        let update = json!({
            "player": { "hp": 80, "status_effects": ["bleeding"] }
        });
        deep_merge(&mut base, &update);
        assert_eq!(base["player"]["hp"], 80);
        assert_eq!(base["player"]["mp"], 50);
        assert_eq!(base["player"]["status_effects"], json!(["bleeding"]));
        assert_eq!(base["scene"]["location"], "tavern");
    }

    #[test]
    fn partial_delta_never_deletes_subtrees() {
        let state = WorldState::initial("Alice");
        let merged = state.apply_delta(&json!({ "scene": { "atmosphere": "战斗" } }));
        assert_eq!(merged.scene.atmosphere, "战斗");
        assert_eq!(merged.player.name, "Alice");
        assert_eq!(merged.player.hp, 100);
        assert_eq!(merged.world_time, WorldTime::default());
        assert_eq!(merged.narrator_persona, NarratorPersona::default());
    }

    #[test]
    fn normalize_fills_missing_subtrees() {
        let state = WorldState::normalize(json!({ "player": { "name": "Bob" } }));
        assert_eq!(state.player.name, "Bob");
        assert_eq!(state.player.max_hp, 100);
        assert_eq!(state.scene.location, "未知地点");
        assert_eq!(state.world_time, WorldTime::default());
    }

    #[test]
    fn normalize_migrates_legacy_flat_fields() {
        let state = WorldState::normalize(json!({
            "hp": 42,
            "inventory": ["sword", "bread"],
            "location": "old town",
            "world_time": "Day 1, 08:00"
        }));
        assert_eq!(state.player.hp, 42);
        assert_eq!(state.inventory["sword"].kind, "item");
        assert_eq!(state.inventory["sword"].count, 1);
        assert_eq!(state.inventory["bread"].count, 1);
        assert_eq!(state.scene.location, "old town");
        assert_eq!(state.world_time, WorldTime::default());
    }

    #[test]
    fn relationship_round_trips_prose_keys() {
        let rel = Relationship {
            relation: "挚友".into(),
            recent_events: vec!["并肩作战".into()],
            personality_note: "沉默寡言".into(),
        };
        let v = serde_json::to_value(&rel).unwrap();
        assert!(v.get("关系").is_some());
        assert!(v.get("近期事件").is_some());
        let back: Relationship = serde_json::from_value(v).unwrap();
        assert_eq!(back, rel);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = WorldState::initial("Alice");
        state.skills.insert(
            "剑术".into(),
            Skill {
                level: 3,
                exp: 40,
                description: "基础剑技".into(),
            },
        );
        let v = state.to_value();
        let back = WorldState::normalize(v);
        assert_eq!(back, state);
    }
}
