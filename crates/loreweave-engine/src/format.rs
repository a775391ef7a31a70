//! Prompt-facing formatting of the world state.

use loreweave_core::state::WorldState;
use loreweave_store::ContextMessage;

/// Writing-style guidance per scene atmosphere.
pub fn atmosphere_style(atmosphere: &str) -> &'static str {
    match atmosphere {
        "紧张" => "短句为主，动词密集，节奏紧凑，少用形容词",
        "战斗" => "动作描写密集，紧张刺激，可有痛感和血腥描写",
        "浪漫" => "感官细节丰富，节奏舒缓，注重情感流动和氛围营造",
        "亲密" => "大胆露骨，感官描写详尽，不回避任何细节",
        "诡异" => "暗示性描写，营造不安和悬疑，多用隐喻",
        "恐怖" => "压迫感，未知的恐惧，感官上的不适",
        "悲伤" => "内省基调，关注内心感受，节奏放缓",
        "轻松" => "自然对话，可以有幽默，节奏轻快",
        "日常" => "生活化描写，细节真实，对话自然",
        _ => "正常叙事风格",
    }
}

pub fn format_player_status(state: &WorldState) -> String {
    let p = &state.player;
    let mut lines = vec![format!("HP: {}/{}", p.hp, p.max_hp)];
    if p.max_mp > 0 {
        lines.push(format!("MP: {}/{}", p.mp, p.max_mp));
    }
    if !p.status_effects.is_empty() {
        lines.push(format!("状态: {}", p.status_effects.join(", ")));
    }
    lines.join(" | ")
}

pub fn format_relationships(state: &WorldState) -> String {
    if state.relationships.is_empty() {
        return "暂无已建立的人物关系".to_string();
    }
    let mut lines = Vec::new();
    for (name, rel) in &state.relationships {
        let mut line = format!("【{name}】{}", rel.relation);
        if !rel.recent_events.is_empty() {
            let recent: Vec<&str> = rel
                .recent_events
                .iter()
                .rev()
                .take(3)
                .rev()
                .map(String::as_str)
                .collect();
            line.push_str(&format!("\n  近期: {}", recent.join("; ")));
        }
        if !rel.personality_note.is_empty() {
            line.push_str(&format!("\n  备注: {}", rel.personality_note));
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub fn format_skills(state: &WorldState) -> String {
    if state.skills.is_empty() {
        return "暂无技能".to_string();
    }
    state
        .skills
        .iter()
        .map(|(name, s)| {
            let mut line = format!("- {name} Lv.{} (经验: {}/100)", s.level, s.exp);
            if !s.description.is_empty() {
                line.push_str(&format!(" - {}", s.description));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_inventory(state: &WorldState) -> String {
    if state.inventory.is_empty() {
        return "背包为空".to_string();
    }
    let mut equipped = Vec::new();
    let mut items = Vec::new();
    for (name, item) in &state.inventory {
        let mut entry = if item.count > 1 {
            format!("{name} x{}", item.count)
        } else {
            name.clone()
        };
        if !item.description.is_empty() {
            entry.push_str(&format!(" ({})", item.description));
        }
        if item.equipped {
            equipped.push(format!("[装备中] {entry}"));
        } else {
            items.push(format!("- {entry}"));
        }
    }
    equipped.extend(items);
    equipped.join("\n")
}

pub fn format_skills_and_items(state: &WorldState) -> String {
    format!(
        "【技能】\n{}\n\n【物品】\n{}",
        format_skills(state),
        format_inventory(state)
    )
}

/// Scene fields pre-rendered for prompt templates.
pub struct SceneInfo {
    pub location: String,
    pub atmosphere: String,
    pub weather: String,
    pub npcs_present: String,
}

pub fn format_scene(state: &WorldState) -> SceneInfo {
    let scene = &state.scene;
    let location = if scene.sub_location.is_empty() {
        scene.location.clone()
    } else {
        format!("{} - {}", scene.location, scene.sub_location)
    };
    SceneInfo {
        location,
        atmosphere: scene.atmosphere.clone(),
        weather: scene.weather.clone(),
        npcs_present: if scene.npcs_present.is_empty() {
            "无".to_string()
        } else {
            scene.npcs_present.join(", ")
        },
    }
}

pub fn format_persona_voice(state: &WorldState) -> String {
    format!(
        "当前心情: {}\n说话风格: {}",
        state.narrator_persona.current_mood, state.narrator_persona.speech_style
    )
}

/// Transcript rendering with display names instead of wire roles.
pub fn format_history_text(history: &[ContextMessage], char_name: &str) -> String {
    history
        .iter()
        .map(|msg| match msg.role.as_str() {
            "user" => format!("Player: {}", msg.content),
            "assistant" => format!("{char_name}: {}", msg.content),
            other => format!("[{other}]: {}", msg.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
