//! Post-turn fan-out.
//!
//! The state update always runs first so the committed timeline tag is
//! available to the compressor; the compressor, graph extractor and
//! sociologist then run in parallel. Nothing on the reply path waits for
//! any of this.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use loreweave_core::state::{TimeOfDay, WorldState};
use loreweave_graph::Triplet;
use loreweave_llm::Message;

use crate::engine::{ActiveSession, Engine};
use crate::prompts;
use crate::util::clean_json;

/// Shorter exchanges carry no extractable relations.
const MIN_EXTRACTION_CHARS: usize = 100;
/// Sociologist skips trivial narrator outputs.
const MIN_SOCIOLOGIST_CHARS: usize = 50;
/// Fallback clock advance when the status LLM reply is unusable.
const DEFAULT_ADVANCE_MINUTES: u32 = 10;

impl Engine {
    pub(crate) async fn run_background_tasks(
        &self,
        active: ActiveSession,
        user_input: &str,
        narrator_output: &str,
        assistant_msg_id: i64,
    ) {
        let timeline_tag = self
            .run_status_update(&active, user_input, narrator_output, assistant_msg_id)
            .await;

        tokio::join!(
            self.compressor.run_once(active.id, &active.uuid, &timeline_tag),
            self.run_graph_extraction(user_input, narrator_output),
            self.run_sociologist(user_input, narrator_output),
        );
    }

    // ── state engine ────────────────────────────────────────────────────────

    /// Merge the status LLM's partial state into the current state and
    /// snapshot it against the assistant message. Any parse or provider
    /// failure degrades to a deterministic ten-minute clock advance.
    pub(crate) async fn run_status_update(
        &self,
        active: &ActiveSession,
        user_input: &str,
        narrator_output: &str,
        assistant_msg_id: i64,
    ) -> String {
        let raw = self.store.current_state(active.id).unwrap_or_default();
        let current = WorldState::normalize(raw);

        let state_json = serde_json::to_string_pretty(&current.to_value())
            .unwrap_or_else(|_| "{}".to_string());
        let prompt = prompts::role_prompt(&self.roles.status, prompts::STATUS)
            .replace("{current_state}", &state_json)
            .replace("{user_input}", user_input)
            .replace("{narrator_output}", narrator_output);

        info!("status model analysing state changes");
        let reply = match self.roles.status.generate(vec![Message::user(prompt)]).await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "status model failed, advancing clock");
                return self
                    .advance_time_default(active, current, assistant_msg_id)
                    .await;
            }
        };

        let Some(data) = clean_json(&reply) else {
            warn!("status reply unparseable, advancing clock");
            return self
                .advance_time_default(active, current, assistant_msg_id)
                .await;
        };

        let delta = data.get("state").cloned().unwrap_or(Value::Null);
        if !delta.is_object() || delta.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            return self
                .advance_time_default(active, current, assistant_msg_id)
                .await;
        }

        let new_state = current.apply_delta(&delta);

        // the clock is authoritative once the delta touched it
        let timeline_tag = if delta.get("world_time").is_some() {
            new_state.timeline_tag()
        } else {
            data.get("timeline_tag")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| new_state.timeline_tag())
        };

        log_state_changes(&current, &new_state);

        if let Err(e) = self.store.save_state(
            active.id,
            &new_state.to_value(),
            &format!("Time: {timeline_tag}"),
            Some(assistant_msg_id),
        ) {
            error!(err = %e, "state persist failed");
            return timeline_tag;
        }
        self.hot.cache_state(&active.uuid, &new_state.to_value()).await;
        info!(%timeline_tag, "state advanced");
        timeline_tag
    }

    async fn advance_time_default(
        &self,
        active: &ActiveSession,
        mut state: WorldState,
        assistant_msg_id: i64,
    ) -> String {
        state.world_time.advance_minutes(DEFAULT_ADVANCE_MINUTES);
        state.scene.time_of_day = TimeOfDay::from_hour(state.world_time.hour);
        let tag = state.timeline_tag();

        if let Err(e) = self.store.save_state(
            active.id,
            &state.to_value(),
            "Auto time advance",
            Some(assistant_msg_id),
        ) {
            error!(err = %e, "state persist failed");
            return tag;
        }
        self.hot.cache_state(&active.uuid, &state.to_value()).await;
        info!(timeline_tag = %tag, "clock advanced by default");
        tag
    }

    // ── graph extraction ────────────────────────────────────────────────────

    pub(crate) async fn run_graph_extraction(&self, user_input: &str, narrator_output: &str) {
        let text = format!("User: {user_input}\nNarrator: {narrator_output}");
        if text.chars().count() < MIN_EXTRACTION_CHARS {
            return;
        }

        let prompt = prompts::GRAPH_EXTRACTOR.replace("{text}", &text);
        let reply = match self
            .roles
            .sociologist
            .generate(vec![Message::user(prompt)])
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(err = %e, "graph extractor failed");
                return;
            }
        };

        let Some(data) = clean_json(&reply) else {
            return;
        };
        let triplets: Vec<Triplet> = data
            .get("triplets")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let triplets: Vec<Triplet> = triplets
            .into_iter()
            .filter(|t| !t.source.is_empty() && !t.relation.is_empty() && !t.target.is_empty())
            .collect();
        if triplets.is_empty() {
            return;
        }

        let preview: Vec<String> = triplets
            .iter()
            .take(3)
            .map(|t| format!("({}--{}-->{})", t.source, t.relation, t.target))
            .collect();
        self.graph.add_triplets_batch(&triplets).await;
        info!(count = triplets.len(), preview = ?preview, "graph updated");
    }

    // ── sociologist ─────────────────────────────────────────────────────────

    /// Observation-only pass; its value is the log trail.
    pub(crate) async fn run_sociologist(&self, user_input: &str, narrator_output: &str) {
        if narrator_output.chars().count() < MIN_SOCIOLOGIST_CHARS {
            return;
        }
        let prompt = prompts::role_prompt(&self.roles.sociologist, prompts::SOCIOLOGIST).replace(
            "{interaction}",
            &format!("User: {user_input}\nAI: {narrator_output}"),
        );
        match self
            .roles
            .sociologist
            .generate(vec![Message::user(prompt)])
            .await
        {
            Ok(observation) => debug!(
                preview = %observation.chars().take(120).collect::<String>(),
                "sociologist observation"
            ),
            Err(e) => debug!(err = %e, "sociologist skipped"),
        }
    }
}

/// INFO-level digest of what the merge changed.
fn log_state_changes(old: &WorldState, new: &WorldState) {
    let mut changes = Vec::new();

    if old.player.hp != new.player.hp {
        let diff = new.player.hp - old.player.hp;
        changes.push(format!(
            "HP: {} → {} ({}{diff})",
            old.player.hp,
            new.player.hp,
            if diff > 0 { "+" } else { "" }
        ));
    }

    for (name, rel) in &new.relationships {
        match old.relationships.get(name) {
            None => changes.push(format!("新关系: {name}")),
            Some(old_rel) if old_rel != rel => changes.push(format!("关系更新: {name}")),
            _ => {}
        }
    }

    for item in new.inventory.keys() {
        if !old.inventory.contains_key(item) {
            changes.push(format!("获得物品: {item}"));
        }
    }
    for item in old.inventory.keys() {
        if !new.inventory.contains_key(item) {
            changes.push(format!("失去物品: {item}"));
        }
    }

    for (skill, detail) in &new.skills {
        match old.skills.get(skill) {
            None => changes.push(format!("习得技能: {skill}")),
            Some(old_skill) if detail.level > old_skill.level => changes.push(format!(
                "技能升级: {skill} Lv.{} → Lv.{}",
                old_skill.level, detail.level
            )),
            _ => {}
        }
    }

    if old.scene.atmosphere != new.scene.atmosphere && !new.scene.atmosphere.is_empty() {
        changes.push(format!(
            "氛围变化: {} → {}",
            old.scene.atmosphere, new.scene.atmosphere
        ));
    }

    if !changes.is_empty() {
        info!(changes = %changes.join(" | "), "state changes");
    }
}
