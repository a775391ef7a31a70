//! Tolerant parsing of LLM replies.

use serde_json::Value;

/// Pull a JSON object out of an LLM reply: direct parse first, then a
/// fenced ``` block, then the widest brace span. `None` means the caller
/// applies its deterministic fallback.
pub fn clean_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    // fenced code block, optionally tagged "json"
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(v);
            }
        }
    }

    // widest bare object span
    let open = trimmed.find('{')?;
    let close = trimmed.rfind('}')?;
    if close > open {
        if let Ok(v) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
            return Some(v);
        }
    }
    None
}

/// Parse a rule-selection reply into 1-based option indices.
///
/// Tolerant by design: any integer token in the reply counts, values outside
/// `[1..=max_options]` are dropped, duplicates keep their first position.
/// A reply containing "NONE" (any case) selects nothing.
pub fn parse_rule_selection(reply: &str, max_options: usize) -> Vec<usize> {
    if reply.trim().is_empty() || reply.to_uppercase().contains("NONE") {
        return Vec::new();
    }

    let mut selected = Vec::new();
    let mut current = String::new();
    for c in reply.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse::<usize>() {
                if (1..=max_options).contains(&n) && !selected.contains(&n) {
                    selected.push(n);
                }
            }
            current.clear();
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_json_accepts_direct_objects() {
        assert_eq!(
            clean_json(r#"{"a": 1}"#).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn clean_json_unwraps_fenced_blocks() {
        let reply = "Here you go:\n```json\n{\"state\": {\"hp\": 90}}\n```\nDone.";
        assert_eq!(clean_json(reply).unwrap(), json!({"state": {"hp": 90}}));

        let untagged = "```\n{\"x\": true}\n```";
        assert_eq!(clean_json(untagged).unwrap(), json!({"x": true}));
    }

    #[test]
    fn clean_json_extracts_bare_braces() {
        let reply = "I think the update is {\"timeline_tag\": \"Day 1, 08:10\"} overall.";
        assert_eq!(
            clean_json(reply).unwrap()["timeline_tag"],
            "Day 1, 08:10"
        );
    }

    #[test]
    fn clean_json_rejects_garbage() {
        assert!(clean_json("no json here").is_none());
        assert!(clean_json("").is_none());
        assert!(clean_json("{broken").is_none());
    }

    #[test]
    fn rule_selection_grammar() {
        assert_eq!(parse_rule_selection("1,3", 5), vec![1, 3]);
        assert_eq!(parse_rule_selection("Options 2 and 4 apply.", 5), vec![2, 4]);
        assert_eq!(parse_rule_selection("3, 3, 1", 5), vec![3, 1]);
        assert_eq!(parse_rule_selection("7, 2", 5), vec![2]);
        assert_eq!(parse_rule_selection("NONE", 5), Vec::<usize>::new());
        assert_eq!(parse_rule_selection("none of these", 5), Vec::<usize>::new());
        assert_eq!(parse_rule_selection("", 5), Vec::<usize>::new());
        assert_eq!(parse_rule_selection("0", 5), Vec::<usize>::new());
    }
}
