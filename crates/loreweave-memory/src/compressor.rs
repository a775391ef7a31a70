//! Hierarchical memory compression.
//!
//! After each turn the earliest five un-summarized messages are compressed
//! into one MICRO node by a draft/critic LLM pair; every ten un-merged
//! MICRO nodes fold into a MACRO node, which in turn triggers a long-form
//! saga entry from the historian. Windows are hard: fewer than five
//! messages (or ten micros) simply wait for the next turn, and any LLM
//! failure leaves the window unconsumed so the next turn retries.

use std::sync::Arc;

use tracing::{error, info, warn};

use loreweave_harvester::HarvesterHandle;
use loreweave_llm::{Message, RoleClient};
use loreweave_store::{ChatStore, MemoryLevel, MessageRecord};
use loreweave_vector::VectorCollection;

/// Messages folded into one MICRO summary.
const MICRO_WINDOW: usize = 5;
/// MICRO nodes folded into one MACRO summary.
const MACRO_WINDOW: usize = 10;
/// Probe keywords longer than this are noise, not entities.
const MAX_PROBE_KEYWORD_CHARS: usize = 30;
/// Queue priority for world-expansion probes (lower pops first).
const PROBE_PRIORITY: u8 = 5;

const DEFAULT_DRAFT_PROMPT: &str = "请将以下对话压缩成一段简洁的剧情摘要，保留人物、地点、事件与因果。\n\
时间: {time}\n\n对话:\n{text}\n\n摘要:";

const DEFAULT_CRITIC_PROMPT: &str = "你是摘要审校者。对照原文核查草稿的事实性，删除原文没有的内容，\
补上遗漏的关键事件，输出修订后的最终摘要。\n\n【草稿】\n{draft}\n\n【原文】\n{original}\n\n【最终摘要】";

const DEFAULT_MERGE_PROMPT: &str = "请将以下微观记忆合并成一段连贯的宏观叙述:\n{micros}";

const DEFAULT_HISTORIAN_PROMPT: &str = "你是史官。基于以下宏观记忆，撰写一段编年史章节，\
文风庄重，第三人称，保留时间线。\n\n【宏观记忆】\n{macro_content}\n\n【章节】";

const PROBE_PROMPT: &str = "Analyze the following dialogue:\n{text}\n\n\
Identify ONE specific proper noun, event, or concept that needs external knowledge. \
Return ONLY the keyword. If nothing needs research, return 'NONE'.";

pub struct MemoryCompressor {
    store: Arc<ChatStore>,
    memory_vec: Arc<VectorCollection>,
    draft: RoleClient,
    critic: RoleClient,
    historian: RoleClient,
    harvester: HarvesterHandle,
}

impl MemoryCompressor {
    pub fn new(
        store: Arc<ChatStore>,
        memory_vec: Arc<VectorCollection>,
        draft: RoleClient,
        critic: RoleClient,
        historian: RoleClient,
        harvester: HarvesterHandle,
    ) -> Self {
        Self {
            store,
            memory_vec,
            draft,
            critic,
            historian,
            harvester,
        }
    }

    /// One compression pass for a session. Called from the post-turn fan-out
    /// with the timeline tag the state engine just committed.
    pub async fn run_once(&self, session_id: i64, session_uuid: &str, timeline_tag: &str) {
        let messages = match self.store.unsummarized_messages(session_id, MICRO_WINDOW) {
            Ok(m) => m,
            Err(e) => {
                error!(err = %e, "unsummarized window read failed");
                return;
            }
        };
        if messages.len() < MICRO_WINDOW {
            return;
        }

        info!(count = messages.len(), "micro compression triggered");
        let raw_text = render_messages(&messages);

        self.probe_world_expansion(&raw_text).await;

        // draft, then critic — either failure leaves the window unconsumed
        let draft_prompt = template(self.draft.prompt(), DEFAULT_DRAFT_PROMPT)
            .replace("{text}", &raw_text)
            .replace("{time}", timeline_tag);
        let draft = match self.draft.generate(vec![Message::user(draft_prompt)]).await {
            Ok(d) => d,
            Err(e) => {
                error!(err = %e, "draft compression failed, window retried next turn");
                return;
            }
        };

        let critic_prompt = template(self.critic.prompt(), DEFAULT_CRITIC_PROMPT)
            .replace("{draft}", &draft)
            .replace("{original}", &raw_text);
        let final_micro = match self.critic.generate(vec![Message::user(critic_prompt)]).await {
            Ok(m) => m,
            Err(e) => {
                error!(err = %e, "critic pass failed, window retried next turn");
                return;
            }
        };

        let vector_id = vector_id("micro");
        if let Err(e) = self.store.add_memory_node(
            session_id,
            &final_micro,
            MemoryLevel::Micro,
            timeline_tag,
            &vector_id,
        ) {
            error!(err = %e, "micro node insert failed");
            return;
        }
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        if let Err(e) = self.store.mark_messages_summarized(&ids) {
            error!(err = %e, "summarized flag update failed");
            return;
        }

        let metadata = serde_json::json!({
            "type": "episodic",
            "level": "MICRO",
            "timeline": timeline_tag,
            "session_id": session_uuid,
        });
        if let Err(e) = self.memory_vec.add(&final_micro, metadata, &vector_id).await {
            warn!(err = %e, "micro vector upsert failed");
        }
        info!(
            preview = %final_micro.chars().take(50).collect::<String>(),
            "micro summary stored"
        );

        self.maybe_rollover_macro(session_id, session_uuid).await;
    }

    /// Side task: name one proper noun from the window that needs outside
    /// knowledge and queue it for the harvester.
    async fn probe_world_expansion(&self, raw_text: &str) {
        let excerpt: String = raw_text.chars().take(2000).collect();
        let prompt = PROBE_PROMPT.replace("{text}", &excerpt);

        let reply = match self.draft.generate(vec![Message::user(prompt)]).await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "world-expansion probe failed");
                return;
            }
        };

        let keyword = reply
            .trim()
            .replace(['"', '\''], "")
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if !keyword.is_empty()
            && !keyword.to_uppercase().contains("NONE")
            && keyword.chars().count() < MAX_PROBE_KEYWORD_CHARS
        {
            info!(keyword, "world-expansion probe queued");
            self.harvester.add_task(&keyword, PROBE_PRIORITY);
        }
    }

    /// Fold ten un-merged micros into one macro and chronicle it.
    async fn maybe_rollover_macro(&self, session_id: i64, session_uuid: &str) {
        let micros = match self.store.unmerged_micro_nodes(session_id, MACRO_WINDOW) {
            Ok(m) => m,
            Err(e) => {
                error!(err = %e, "micro window read failed");
                return;
            }
        };
        if micros.len() < MACRO_WINDOW {
            return;
        }

        info!(count = micros.len(), "macro compression triggered");
        let micro_text: String = micros
            .iter()
            .map(|m| format!("[{}] {}\n", m.timeline_tag, m.summary_text))
            .collect();
        let merge_prompt = DEFAULT_MERGE_PROMPT.replace("{micros}", &micro_text);

        let macro_summary = match self.critic.generate(vec![Message::user(merge_prompt)]).await {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "macro merge failed, micros retried next turn");
                return;
            }
        };

        // macro inherits the first constituent micro's tag
        let macro_tag = micros[0].timeline_tag.clone();
        let vector_id = vector_id("macro");
        if let Err(e) = self.store.add_memory_node(
            session_id,
            &macro_summary,
            MemoryLevel::Macro,
            &macro_tag,
            &vector_id,
        ) {
            error!(err = %e, "macro node insert failed");
            return;
        }
        let ids: Vec<i64> = micros.iter().map(|m| m.id).collect();
        if let Err(e) = self.store.mark_nodes_merged(&ids) {
            error!(err = %e, "merged flag update failed");
            return;
        }

        let metadata = serde_json::json!({
            "type": "episodic",
            "level": "MACRO",
            "session_id": session_uuid,
        });
        if let Err(e) = self.memory_vec.add(&macro_summary, metadata, &vector_id).await {
            warn!(err = %e, "macro vector upsert failed");
        }
        info!(
            preview = %macro_summary.chars().take(50).collect::<String>(),
            "macro summary stored"
        );

        self.write_saga(session_id, &macro_summary).await;
    }

    async fn write_saga(&self, session_id: i64, macro_summary: &str) {
        info!("historian writing chapter");
        let prompt = template(self.historian.prompt(), DEFAULT_HISTORIAN_PROMPT)
            .replace("{macro_content}", macro_summary);
        match self.historian.generate(vec![Message::user(prompt)]).await {
            Ok(saga) => {
                if let Err(e) = self.store.add_saga_entry(session_id, &saga) {
                    error!(err = %e, "saga insert failed");
                } else {
                    info!("chapter archived");
                }
            }
            Err(e) => error!(err = %e, "historian failed, no chapter this rollover"),
        }
    }
}

fn render_messages(messages: &[MessageRecord]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Configured role prompt when present, built-in template otherwise.
fn template<'a>(configured: &'a str, default: &'a str) -> &'a str {
    if configured.trim().is_empty() {
        default
    } else {
        configured
    }
}

fn vector_id(prefix: &str) -> String {
    let ts = chrono::Utc::now().timestamp();
    let tail: String = uuid::Uuid::new_v4().simple().to_string()[..4].to_string();
    format!("{prefix}_{ts}_{tail}")
}
