//! The turn pipeline: Reflex → Rules RAG → Memory RAG → GraphRAG →
//! Director → Narrator stream → post-turn fan-out.
//!
//! Chunks stream through the caller's channel; a dropped receiver only
//! stops delivery — the full reply still accumulates and post-turn
//! persistence always runs. Every retrieval stage fails soft: an error is
//! logged and substituted with an empty result.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use loreweave_core::logbus::LogEvent;
use loreweave_llm::{Message, StreamEvent};
use loreweave_store::ContextMessage;
use loreweave_vector::{ScoredRecord, SearchFilter};

use crate::engine::{ActiveSession, Engine};
use crate::format;
use crate::prompts;
use crate::util::parse_rule_selection;

/// Messages of context handed to the reflex stage.
const REFLEX_HISTORY: usize = 5;
/// Messages of context handed to the director.
const DIRECTOR_HISTORY: usize = 10;
/// Messages of context handed to the narrator.
const NARRATOR_HISTORY: usize = 20;
/// Rule candidates fetched per turn.
const RULE_CANDIDATES: usize = 5;
/// Memory hits requested in deep / normal mode.
const DEEP_MEMORY_HITS: usize = 100;
const NORMAL_MEMORY_HITS: usize = 20;
/// Rerank score floor for memory recall.
const MEMORY_SCORE_FLOOR: f32 = 0.2;

/// Emitted when the narrator dies before producing anything.
const NARRATOR_FAILURE_SENTINEL: &str = "(叙事者故障，请重试)";

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatOptions {
    /// Widen memory recall to 100 hits.
    pub deep_mode: bool,
    /// Skip every retrieval/planning stage, straight to the narrator.
    pub lite_mode: bool,
}

impl Engine {
    /// Run one turn. Streamed chunks go through `tx`; the returned handle
    /// covers the deferred post-turn tasks (state update, compression,
    /// graph extraction, sociologist) and is not awaited by callers on the
    /// reply path.
    pub async fn chat(
        self: Arc<Self>,
        user_input: &str,
        opts: ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Option<JoinHandle<()>> {
        let Some(active) = self.active_session() else {
            let _ = tx.send("[系统错误]: 未加载任何会话。".to_string()).await;
            return None;
        };

        let started = Instant::now();
        let history = self.history_list(&active.uuid, active.id).await;
        let turn = history.len() / 2 + 1;
        let state = self.current_state(&active.uuid, active.id).await;

        info!(
            turn,
            deep = opts.deep_mode,
            lite = opts.lite_mode,
            input = %user_input.chars().take(80).collect::<String>(),
            "turn started"
        );

        let scene = format::format_scene(&state);
        let timeline_tag = state.timeline_tag();
        let atmosphere_style = format::atmosphere_style(&scene.atmosphere);

        let mut search_query = user_input.to_string();
        let mut logic_verdict = "（轻量模式跳过）".to_string();
        let mut rules_text = String::new();
        let mut memory_text = String::new();

        if !opts.lite_mode {
            // 1. Reflex — intent and retrieval query
            match self.run_reflex(&active, &history, user_input).await {
                ReflexOutcome::Query(q) => search_query = q,
                ReflexOutcome::Blocked => {
                    warn!("input blocked by reflex");
                    let _ = tx.send("系统拦截：输入包含不安全内容。".to_string()).await;
                    return None;
                }
                ReflexOutcome::Failed => {}
            }

            // 2. Rules RAG
            rules_text = self.run_rules_rag(user_input, &search_query).await;

            // 3. Memory RAG
            memory_text = self
                .run_memory_rag(&active.uuid, &search_query, opts.deep_mode)
                .await;

            // 4. GraphRAG
            let graph_context = self.graph.search_subgraph(&search_query, 5, 1, 0.0).await;
            if !graph_context.is_empty() {
                info!("graph context found");
                memory_text.push_str(&format!("\n\n【知识图谱】\n{graph_context}"));
            }

            // 5. Director — the plan
            logic_verdict = self
                .run_director(
                    &active,
                    &state,
                    &history,
                    &timeline_tag,
                    &rules_text,
                    &memory_text,
                    user_input,
                )
                .await;
            if !logic_verdict.is_empty() {
                let preview: String = logic_verdict.chars().take(80).collect();
                self.bus.publish(LogEvent::director(logic_verdict.clone()));
                let _ = tx.send(format!("\n[导演]: {preview}...\n\n")).await;
            }
        }

        // 6. Narrator — streamed reply
        let narrator_system = prompts::role_prompt(&self.roles.narrator, prompts::NARRATOR)
            .replace("{atmosphere}", &scene.atmosphere)
            .replace("{atmosphere_style}", atmosphere_style)
            .replace("{persona_voice}", &format::format_persona_voice(&state))
            .replace("{scene_info}", &scene.location)
            .replace("{npcs_present}", &scene.npcs_present)
            .replace("{director_note}", &logic_verdict)
            .replace("{dynamic_rules}", &rules_text)
            .replace("{persona}", &active.char_persona);

        let mut messages = vec![Message::system(narrator_system)];
        let recent = tail(&history, NARRATOR_HISTORY);
        for msg in recent {
            messages.push(match msg.role.as_str() {
                "assistant" => Message::assistant(&msg.content),
                _ => Message::user(&msg.content),
            });
        }
        messages.push(Message::user(user_input));

        let full_response = self.stream_narrator(messages.clone(), &tx).await;
        info!(chars = full_response.chars().count(), "narrator output complete");

        // 7. Post-turn — persist both messages, then fan out
        let user_msg_id = match self.store.add_message(active.id, "user", user_input) {
            Ok(id) => id,
            Err(e) => {
                error!(err = %e, "user message persist failed");
                return None;
            }
        };
        let assistant_msg_id = match self
            .store
            .add_message(active.id, "assistant", &full_response)
        {
            Ok(id) => id,
            Err(e) => {
                error!(err = %e, "assistant message persist failed");
                return None;
            }
        };

        let prompt_log = serde_json::to_string(&messages).unwrap_or_default();
        if let Err(e) = self.store.log_interaction(
            active.id,
            assistant_msg_id,
            &prompt_log,
            &memory_text,
            self.roles.narrator.model(),
        ) {
            error!(err = %e, "interaction log failed");
        }

        // refresh the hot context window, trimmed to the history limit
        let mut new_history = history;
        new_history.push(ContextMessage {
            role: "user".to_string(),
            content: user_input.to_string(),
        });
        new_history.push(ContextMessage {
            role: "assistant".to_string(),
            content: full_response.clone(),
        });
        let limit = self.config.history_limit;
        if new_history.len() > limit {
            new_history.drain(..new_history.len() - limit);
        }
        self.hot.cache_context(&active.uuid, &new_history).await;

        info!(
            turn,
            user_msg_id,
            assistant_msg_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn complete, scheduling background tasks"
        );

        let engine = Arc::clone(&self);
        let input = user_input.to_string();
        Some(tokio::spawn(async move {
            engine
                .run_background_tasks(active, &input, &full_response, assistant_msg_id)
                .await;
        }))
    }

    // ── pipeline stages ─────────────────────────────────────────────────────

    async fn run_reflex(
        &self,
        active: &ActiveSession,
        history: &[ContextMessage],
        user_input: &str,
    ) -> ReflexOutcome {
        info!("reflex stage");
        let short_history = format::format_history_text(tail(history, REFLEX_HISTORY), &active.char_name);
        let prompt = prompts::role_prompt(&self.roles.reflex, prompts::REFLEX)
            .replace("{history}", &short_history)
            .replace("{user_input}", user_input);

        let reply = match self.roles.reflex.generate(vec![Message::user(prompt)]).await {
            Ok(r) => r,
            Err(e) => {
                error!(err = %e, "reflex failed, searching with raw input");
                return ReflexOutcome::Failed;
            }
        };

        if reply.to_uppercase().contains("BLOCK") && !user_input.to_uppercase().contains("BLOCK") {
            return ReflexOutcome::Blocked;
        }

        let query = reply
            .trim()
            .replace('"', "")
            .replace("Search Query:", "")
            .trim()
            .to_string();
        if query.is_empty() {
            return ReflexOutcome::Failed;
        }
        info!(query = %query, "reflex produced search query");
        ReflexOutcome::Query(query)
    }

    async fn run_rules_rag(&self, user_input: &str, search_query: &str) -> String {
        info!("rules retrieval");
        let mut active_rules = match self.rules.active_rules() {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "active rules read failed");
                Vec::new()
            }
        };

        let candidates: Vec<ScoredRecord> = self
            .rules_vec
            .search(search_query, RULE_CANDIDATES, &SearchFilter::Any)
            .await;

        if !candidates.is_empty() {
            let options_text: String = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let preview: String =
                        c.content.chars().take(100).collect::<String>().replace('\n', " ");
                    format!("Option {}: {preview}...\n", i + 1)
                })
                .collect();

            let selection_prompt = format!(
                "User Input: {user_input}\nCandidates:\n{options_text}\n\
                 Task: Which rules apply? Output numbers (e.g. 1,3) or NONE."
            );
            let selection = self
                .roles
                .reflex
                .generate(vec![Message::user(selection_prompt)])
                .await
                .unwrap_or_default();

            let indices = parse_rule_selection(&selection, candidates.len());
            for idx in &indices {
                let candidate = &candidates[idx - 1];
                let full = candidate
                    .metadata
                    .get("full_content")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(&candidate.content);
                active_rules.push(full.to_string());
            }
            info!(selected = indices.len(), "rules activated");
        }

        active_rules.join("\n\n")
    }

    async fn run_memory_rag(&self, uuid: &str, search_query: &str, deep_mode: bool) -> String {
        let n_results = if deep_mode {
            DEEP_MEMORY_HITS
        } else {
            NORMAL_MEMORY_HITS
        };
        info!(target = n_results, "memory retrieval");

        let hits = self
            .memory_vec
            .search(
                search_query,
                n_results,
                &SearchFilter::SessionOrInternetLore {
                    session_id: uuid.to_string(),
                },
            )
            .await;

        let parts: Vec<String> = hits
            .iter()
            .filter(|m| m.score > MEMORY_SCORE_FLOOR)
            .map(|m| format!("- {}", m.content))
            .collect();
        info!(recalled = parts.len(), "memories recalled");
        if parts.is_empty() {
            "无相关记忆".to_string()
        } else {
            parts.join("\n")
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_director(
        &self,
        active: &ActiveSession,
        state: &loreweave_core::state::WorldState,
        history: &[ContextMessage],
        timeline_tag: &str,
        rules_text: &str,
        memory_text: &str,
        user_input: &str,
    ) -> String {
        info!("director stage");
        let spine = self
            .store
            .memory_spine(active.id)
            .unwrap_or_else(|_| "No history yet.".to_string());

        let scene = format::format_scene(state);
        let mut recent_history =
            format::format_history_text(tail(history, DIRECTOR_HISTORY), &active.char_name);
        if recent_history.is_empty() {
            recent_history = "(对话刚开始)".to_string();
        }

        let state_json =
            serde_json::to_string_pretty(&state.to_value()).unwrap_or_else(|_| "{}".to_string());
        let prompt = prompts::role_prompt(&self.roles.director, prompts::DIRECTOR)
            .replace("{timeline_tag}", timeline_tag)
            .replace("{location}", &scene.location)
            .replace("{atmosphere}", &scene.atmosphere)
            .replace("{weather}", &scene.weather)
            .replace("{npcs_present}", &scene.npcs_present)
            .replace("{player_status}", &format::format_player_status(state))
            .replace("{relationships_text}", &format::format_relationships(state))
            .replace("{skills_and_items}", &format::format_skills_and_items(state))
            .replace("{state}", &state_json)
            .replace("{dynamic_rules}", rules_text)
            .replace("{spine}", &spine)
            .replace("{rag_details}", memory_text)
            .replace("{recent_history}", &recent_history)
            .replace("{user_input}", user_input);

        match self.roles.director.generate(vec![Message::user(prompt)]).await {
            Ok(verdict) => {
                info!(
                    preview = %verdict.chars().take(120).collect::<String>(),
                    "director verdict"
                );
                verdict
            }
            Err(e) => {
                error!(err = %e, "director failed, narrating without a plan");
                String::new()
            }
        }
    }

    /// Drive the narrator stream, forwarding deltas to the caller. The
    /// full text accumulates even after the receiver goes away.
    async fn stream_narrator(&self, messages: Vec<Message>, tx: &mpsc::Sender<String>) -> String {
        info!("narrator streaming");
        let (etx, mut erx) = mpsc::channel::<StreamEvent>(64);
        let narrator = self.roles.narrator.clone();
        let generator = tokio::spawn(async move { narrator.generate_stream(messages, etx).await });

        let mut full_response = String::new();
        while let Some(event) = erx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    full_response.push_str(&text);
                    let _ = tx.send(text).await;
                }
                StreamEvent::Done { .. } => {}
                StreamEvent::Error { message } => {
                    error!(err = %message, "narrator stream error");
                    break;
                }
            }
        }

        match generator.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(err = %e, "narrator stream failed"),
            Err(e) => error!(err = %e, "narrator task panicked"),
        }

        if full_response.is_empty() {
            full_response = NARRATOR_FAILURE_SENTINEL.to_string();
            let _ = tx.send(full_response.clone()).await;
        }
        full_response
    }
}

enum ReflexOutcome {
    Query(String),
    Blocked,
    Failed,
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    if items.len() > n {
        &items[items.len() - n..]
    } else {
        items
    }
}
