use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A graph node: one named entity (character, place, item, faction, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Unix seconds of first appearance.
    #[serde(default)]
    pub first_seen: i64,
}

fn default_kind() -> String {
    "entity".to_string()
}

/// A directed edge. Re-asserting the same `(u, v)` pair accumulates:
/// weight grows by the assertion confidence, relation and description sets
/// take the union, the first-inserted relation stays primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationEdge {
    /// Primary relation — first one ever asserted for this pair.
    pub relation: String,
    pub relations: BTreeSet<String>,
    /// Primary description — first non-empty one asserted.
    pub desc: String,
    pub descriptions: BTreeSet<String>,
    pub weight: f64,
    pub first_seen: i64,
    pub last_updated: i64,
}

impl RelationEdge {
    pub fn new(relation: &str, desc: &str, confidence: f64, now: i64) -> Self {
        let mut relations = BTreeSet::new();
        relations.insert(relation.to_string());
        let mut descriptions = BTreeSet::new();
        if !desc.is_empty() {
            descriptions.insert(desc.to_string());
        }
        Self {
            relation: relation.to_string(),
            relations,
            desc: desc.to_string(),
            descriptions,
            weight: confidence,
            first_seen: now,
            last_updated: now,
        }
    }

    /// Fold another assertion into this edge. Commutative over weight,
    /// associative over the sets, last-writer-wins on `last_updated`.
    pub fn accumulate(&mut self, relation: &str, desc: &str, confidence: f64, now: i64) {
        self.weight += confidence;
        self.relations.insert(relation.to_string());
        if !desc.is_empty() {
            self.descriptions.insert(desc.to_string());
            if self.desc.is_empty() {
                self.desc = desc.to_string();
            }
        }
        self.last_updated = now;
    }
}

/// One extracted relation assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triplet {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// In/out edge lists of one entity, weight-descending.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityRelations {
    pub outgoing: Vec<RelationSummary>,
    pub incoming: Vec<RelationSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationSummary {
    /// The other endpoint.
    pub entity: String,
    pub relation: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub vectors_cached: usize,
    pub aliases: usize,
    pub avg_edge_weight: f64,
    pub max_edge_weight: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_is_order_independent() {
        let mut ab = RelationEdge::new("hates", "first fight", 1.0, 100);
        ab.accumulate("loathes", "second fight", 1.0, 200);

        let mut ba = RelationEdge::new("hates", "first fight", 1.0, 100);
        ba.accumulate("loathes", "second fight", 1.0, 150);
        ba.accumulate("hates", "first fight", 0.0, 200);
        // weight aside, set contents agree regardless of assertion order
        assert_eq!(ab.relations, ba.relations);
        assert_eq!(ab.descriptions, ba.descriptions);
        assert_eq!(ab.last_updated, ba.last_updated);
    }

    #[test]
    fn triplet_defaults_confidence() {
        let t: Triplet = serde_json::from_str(
            r#"{"source": "Alice", "relation": "knows", "target": "Bob"}"#,
        )
        .unwrap();
        assert_eq!(t.confidence, 1.0);
        assert!(t.desc.is_empty());
    }
}
