use serde::{Deserialize, Serialize};

/// A persisted conversation session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: i64,
    pub uuid: String,
    pub character_name: String,
    pub created_at: String,
}

/// One message of the ordered per-session log.
/// Immutable after insert except for the `is_summarized` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub is_summarized: bool,
}

/// Compression levels of the memory spine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryLevel {
    Micro,
    Macro,
}

impl std::fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Micro => write!(f, "MICRO"),
            Self::Macro => write!(f, "MACRO"),
        }
    }
}

impl std::str::FromStr for MemoryLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MICRO" => Ok(Self::Micro),
            "MACRO" => Ok(Self::Macro),
            other => Err(format!("unknown memory level: {other}")),
        }
    }
}

/// A compressed memory summary. `is_merged` is meaningful for MICRO nodes
/// only — it marks micros already folded into a macro.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: i64,
    pub summary_text: String,
    pub level: MemoryLevel,
    pub timeline_tag: String,
    pub vector_id: String,
    pub is_merged: bool,
    pub created_at: String,
}

/// Minimal message shape kept in the hot-cache context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_level_round_trips() {
        assert_eq!("MICRO".parse::<MemoryLevel>().unwrap(), MemoryLevel::Micro);
        assert_eq!(MemoryLevel::Macro.to_string(), "MACRO");
        assert!("mini".parse::<MemoryLevel>().is_err());
    }
}
