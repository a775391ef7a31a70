//! Per-session knowledge graph.
//!
//! A directed multi-relation graph with weighted edges, a lowercase alias
//! map resolving alternate entity names, and a node-embedding cache for
//! semantic lookup. Persists as a file triplet per session: the petgraph
//! document, the alias map, and the cached node vectors. Saves are
//! debounced — at most one write per 30 s unless flushed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::{debug, info, warn};

use loreweave_vector::{cosine_similarity, Embedder};

use crate::error::Result;
use crate::types::{
    EntityNode, EntityRelations, GraphStats, RelationEdge, RelationSummary, Triplet,
};

const SAVE_INTERVAL_SECS: i64 = 30;
const SEMANTIC_MIN_SCORE: f32 = 0.1;
const KEYWORD_MIN_SCORE: f32 = 0.01;

struct GraphInner {
    graph: StableDiGraph<EntityNode, RelationEdge>,
    node_index: HashMap<String, NodeIndex>,
    node_vectors: BTreeMap<String, Vec<f32>>,
    aliases: BTreeMap<String, String>,
    session_uuid: Option<String>,
    dirty: bool,
    last_save: i64,
}

impl GraphInner {
    fn empty() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_index: HashMap::new(),
            node_vectors: BTreeMap::new(),
            aliases: BTreeMap::new(),
            session_uuid: None,
            dirty: false,
            last_save: 0,
        }
    }

    fn resolve(&self, name: &str) -> String {
        let trimmed = name.trim();
        let key = trimmed.to_lowercase();
        self.aliases
            .get(&key)
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }
}

pub struct GraphStore {
    inner: Mutex<GraphInner>,
    embedder: Option<Arc<dyn Embedder>>,
    graphs_dir: PathBuf,
}

impl GraphStore {
    pub fn new(graphs_dir: impl Into<PathBuf>, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let graphs_dir = graphs_dir.into();
        std::fs::create_dir_all(graphs_dir.join("vectors"))?;
        Ok(Self {
            inner: Mutex::new(GraphInner::empty()),
            embedder,
            graphs_dir,
        })
    }

    fn graph_path(&self, uuid: &str) -> PathBuf {
        self.graphs_dir.join(format!("graph_{uuid}.json"))
    }

    fn alias_path(&self, uuid: &str) -> PathBuf {
        self.graphs_dir.join(format!("graph_{uuid}_aliases.json"))
    }

    fn vectors_path(&self, uuid: &str) -> PathBuf {
        self.graphs_dir
            .join("vectors")
            .join(format!("vectors_{uuid}.json"))
    }

    // ── session lifecycle ───────────────────────────────────────────────────

    /// Swap in another session's graph, flushing the current one first.
    pub fn switch_session(&self, session_uuid: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.dirty {
            if let Err(e) = self.save_now(&mut inner) {
                warn!(err = %e, "graph save before switch failed");
            }
        }

        *inner = GraphInner::empty();
        inner.session_uuid = Some(session_uuid.to_string());

        if let Err(e) = self.load_into(&mut inner, session_uuid) {
            warn!(err = %e, "graph load failed, starting empty");
        }
        info!(
            session = session_uuid,
            nodes = inner.graph.node_count(),
            edges = inner.graph.edge_count(),
            aliases = inner.aliases.len(),
            "graph session switched"
        );
    }

    fn load_into(&self, inner: &mut GraphInner, uuid: &str) -> Result<()> {
        let graph_path = self.graph_path(uuid);
        if graph_path.exists() {
            let data = std::fs::read_to_string(&graph_path)?;
            inner.graph = serde_json::from_str(&data)?;
            inner.node_index = inner
                .graph
                .node_indices()
                .map(|ix| (inner.graph[ix].name.clone(), ix))
                .collect();
        }

        let alias_path = self.alias_path(uuid);
        if alias_path.exists() {
            let data = std::fs::read_to_string(&alias_path)?;
            inner.aliases = serde_json::from_str(&data)?;
        }

        let vectors_path = self.vectors_path(uuid);
        if vectors_path.exists() {
            let data = std::fs::read_to_string(&vectors_path)?;
            let wrapper: VectorFile = serde_json::from_str(&data)?;
            inner.node_vectors = wrapper.vectors;
        }
        Ok(())
    }

    /// Remove a session's file triplet; resets in-memory state if it was
    /// the loaded one.
    pub fn delete_graph(&self, session_uuid: &str) {
        for path in [
            self.graph_path(session_uuid),
            self.alias_path(session_uuid),
            self.vectors_path(session_uuid),
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), err = %e, "graph file delete failed");
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.session_uuid.as_deref() == Some(session_uuid) {
            *inner = GraphInner::empty();
        }
        info!(session = session_uuid, "graph deleted");
    }

    /// Drop all nodes and edges of the loaded session, keeping the session
    /// binding (files are rewritten on next save).
    pub fn clear_current_graph(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.graph = StableDiGraph::new();
        inner.node_index.clear();
        inner.node_vectors.clear();
        inner.dirty = true;
        info!("current graph cleared");
    }

    // ── persistence ─────────────────────────────────────────────────────────

    fn save_now(&self, inner: &mut GraphInner) -> Result<()> {
        let Some(uuid) = inner.session_uuid.clone() else {
            return Ok(());
        };

        std::fs::write(
            self.graph_path(&uuid),
            serde_json::to_string(&inner.graph)?,
        )?;
        std::fs::write(
            self.alias_path(&uuid),
            serde_json::to_string(&inner.aliases)?,
        )?;
        std::fs::write(
            self.vectors_path(&uuid),
            serde_json::to_string(&VectorFile {
                vectors: inner.node_vectors.clone(),
            })?,
        )?;

        inner.dirty = false;
        inner.last_save = chrono::Utc::now().timestamp();
        debug!(session = %uuid, "graph persisted");
        Ok(())
    }

    fn mark_dirty(&self, inner: &mut GraphInner) {
        inner.dirty = true;
        let now = chrono::Utc::now().timestamp();
        if now - inner.last_save > SAVE_INTERVAL_SECS {
            if let Err(e) = self.save_now(inner) {
                warn!(err = %e, "debounced graph save failed");
            }
        }
    }

    /// Force a write. Called on shutdown and before session switches.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.dirty {
            if let Err(e) = self.save_now(&mut inner) {
                warn!(err = %e, "graph flush failed");
            }
        }
    }

    // ── aliases ─────────────────────────────────────────────────────────────

    /// Register a lowercase alternate for a canonical entity name.
    pub fn add_alias(&self, alias: &str, canonical: &str) {
        if alias.trim().is_empty() || canonical.trim().is_empty() {
            return;
        }
        let key = alias.trim().to_lowercase();
        if key == canonical.trim().to_lowercase() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.aliases.insert(key, canonical.trim().to_string());
        inner.dirty = true;
    }

    /// Canonical name for any alternate spelling. Idempotent.
    pub fn resolve_entity(&self, name: &str) -> String {
        self.inner.lock().unwrap().resolve(name)
    }

    // ── embeddings ──────────────────────────────────────────────────────────

    async fn query_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[text.to_string()]).await {
            Ok(mut v) if !v.is_empty() => Some(v.remove(0)),
            Ok(_) => None,
            Err(e) => {
                debug!(err = %e, "embedding failed, using keyword matching");
                None
            }
        }
    }

    /// Embed any of the given node names that lack a cached vector.
    async fn ensure_node_vectors(&self, names: &[String]) {
        let Some(embedder) = self.embedder.as_ref() else {
            return;
        };
        let missing: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            names
                .iter()
                .filter(|n| !inner.node_vectors.contains_key(*n))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }
        match embedder.embed(&missing).await {
            Ok(vectors) => {
                let mut inner = self.inner.lock().unwrap();
                for (name, vec) in missing.into_iter().zip(vectors) {
                    inner.node_vectors.insert(name, vec);
                }
            }
            Err(e) => debug!(err = %e, "node embedding failed"),
        }
    }

    // ── triplet operations ──────────────────────────────────────────────────

    /// Insert `(src) --[rel]--> (tgt)`, accumulating onto an existing edge.
    pub async fn add_triplet(
        &self,
        source: &str,
        relation: &str,
        target: &str,
        desc: &str,
        confidence: f64,
    ) {
        if source.trim().is_empty() || relation.trim().is_empty() || target.trim().is_empty() {
            return;
        }

        let (source, target) = {
            let inner = self.inner.lock().unwrap();
            (inner.resolve(source), inner.resolve(target))
        };
        let relation = relation.trim().to_string();

        self.ensure_node_vectors(&[source.clone(), target.clone()])
            .await;

        let mut inner = self.inner.lock().unwrap();
        let now = chrono::Utc::now().timestamp();

        let src_ix = Self::node_of(&mut inner, &source, now);
        let tgt_ix = Self::node_of(&mut inner, &target, now);

        if let Some(edge_ix) = inner.graph.find_edge(src_ix, tgt_ix) {
            inner.graph[edge_ix].accumulate(&relation, desc.trim(), confidence, now);
        } else {
            inner
                .graph
                .add_edge(src_ix, tgt_ix, RelationEdge::new(&relation, desc.trim(), confidence, now));
        }
        self.mark_dirty(&mut inner);
    }

    fn node_of(inner: &mut GraphInner, name: &str, now: i64) -> NodeIndex {
        if let Some(ix) = inner.node_index.get(name) {
            return *ix;
        }
        let ix = inner.graph.add_node(EntityNode {
            name: name.to_string(),
            kind: "entity".to_string(),
            first_seen: now,
        });
        inner.node_index.insert(name.to_string(), ix);
        ix
    }

    /// Batch insert, then force a save.
    pub async fn add_triplets_batch(&self, triplets: &[Triplet]) {
        for t in triplets {
            self.add_triplet(&t.source, &t.relation, &t.target, &t.desc, t.confidence)
                .await;
        }
        self.flush();
    }

    // ── search ──────────────────────────────────────────────────────────────

    /// Formatted relation lines around the nodes most relevant to `query`.
    ///
    /// Relevance is cosine similarity against cached node vectors, falling
    /// back to keyword scoring when no embedding capability is available.
    /// Result edges are deduplicated on `(u, primary relation, v)`, filtered
    /// by `min_weight`, and ordered by `node_score × edge_weight`.
    pub async fn search_subgraph(
        &self,
        query: &str,
        top_k: usize,
        depth: usize,
        min_weight: f64,
    ) -> String {
        let query_vec = self.query_embedding(query).await;

        let inner = self.inner.lock().unwrap();
        if inner.graph.node_count() == 0 {
            return String::new();
        }

        let start_nodes = Self::relevant_nodes(&inner, query, query_vec.as_deref(), top_k);
        if start_nodes.is_empty() {
            return String::new();
        }

        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut hits: Vec<(f64, String)> = Vec::new();

        for (start_ix, node_score) in start_nodes {
            for edge_ix in Self::ego_edges(&inner.graph, start_ix, depth) {
                let Some((u_ix, v_ix)) = inner.graph.edge_endpoints(edge_ix) else {
                    continue;
                };
                let edge = &inner.graph[edge_ix];
                if edge.weight < min_weight {
                    continue;
                }
                let u = inner.graph[u_ix].name.clone();
                let v = inner.graph[v_ix].name.clone();
                if !seen.insert((u.clone(), edge.relation.clone(), v.clone())) {
                    continue;
                }
                let score = node_score as f64 * edge.weight;
                hits.push((score, format_edge(&u, &v, edge)));
            }
        }

        hits.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        hits.into_iter()
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn relevant_nodes(
        inner: &GraphInner,
        query: &str,
        query_vec: Option<&[f32]>,
        top_k: usize,
    ) -> Vec<(NodeIndex, f32)> {
        let mut scored: Vec<(NodeIndex, f32)> = Vec::new();

        match query_vec {
            Some(qv) if !inner.node_vectors.is_empty() => {
                for ix in inner.graph.node_indices() {
                    let name = &inner.graph[ix].name;
                    let score = match inner.node_vectors.get(name) {
                        Some(nv) => cosine_similarity(qv, nv),
                        // unembedded nodes fall back to down-weighted keywords
                        None => keyword_match_score(query, name) * 0.5,
                    };
                    if score > SEMANTIC_MIN_SCORE {
                        scored.push((ix, score));
                    }
                }
            }
            _ => {
                for ix in inner.graph.node_indices() {
                    let score = keyword_match_score(query, &inner.graph[ix].name);
                    if score > KEYWORD_MIN_SCORE {
                        scored.push((ix, score));
                    }
                }
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    /// Edges of the induced subgraph reachable within `depth` hops
    /// (following edge direction) from `start`.
    fn ego_edges(
        graph: &StableDiGraph<EntityNode, RelationEdge>,
        start: NodeIndex,
        depth: usize,
    ) -> Vec<petgraph::stable_graph::EdgeIndex> {
        let mut nodes: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<(NodeIndex, usize)> = VecDeque::new();
        nodes.insert(start);
        queue.push_back((start, 0));

        while let Some((node, dist)) = queue.pop_front() {
            if dist >= depth {
                continue;
            }
            for next in graph.neighbors_directed(node, Direction::Outgoing) {
                if nodes.insert(next) {
                    queue.push_back((next, dist + 1));
                }
            }
        }

        graph
            .edge_indices()
            .filter(|&e| {
                graph
                    .edge_endpoints(e)
                    .map(|(u, v)| nodes.contains(&u) && nodes.contains(&v))
                    .unwrap_or(false)
            })
            .collect()
    }

    // ── queries ─────────────────────────────────────────────────────────────

    /// Out/in edges of one entity, strongest first.
    pub fn get_entity_relations(&self, entity: &str) -> EntityRelations {
        let inner = self.inner.lock().unwrap();
        let name = inner.resolve(entity);
        let Some(&ix) = inner.node_index.get(&name) else {
            return EntityRelations::default();
        };

        let mut outgoing: Vec<RelationSummary> = inner
            .graph
            .edges_directed(ix, Direction::Outgoing)
            .map(|e| RelationSummary {
                entity: inner.graph[e.target()].name.clone(),
                relation: e.weight().relation.clone(),
                weight: e.weight().weight,
            })
            .collect();
        let mut incoming: Vec<RelationSummary> = inner
            .graph
            .edges_directed(ix, Direction::Incoming)
            .map(|e| RelationSummary {
                entity: inner.graph[e.source()].name.clone(),
                relation: e.weight().relation.clone(),
                weight: e.weight().weight,
            })
            .collect();

        outgoing.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        incoming.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        EntityRelations { outgoing, incoming }
    }

    /// Shortest directed path between two entities as a formatted chain;
    /// `None` beyond `max_depth` edges or when unreachable.
    pub fn find_path(&self, source: &str, target: &str, max_depth: usize) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let src = *inner.node_index.get(&inner.resolve(source))?;
        let tgt = *inner.node_index.get(&inner.resolve(target))?;

        // BFS, unweighted — fewest edges wins
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([src]);
        let mut found = src == tgt;
        while let Some(node) = queue.pop_front() {
            if found {
                break;
            }
            for next in inner.graph.neighbors_directed(node, Direction::Outgoing) {
                if next != src && !prev.contains_key(&next) {
                    prev.insert(next, node);
                    if next == tgt {
                        found = true;
                        break;
                    }
                    queue.push_back(next);
                }
            }
        }
        if !found {
            return None;
        }

        let mut path = vec![tgt];
        while let Some(&p) = prev.get(path.last().unwrap()) {
            path.push(p);
        }
        path.reverse();
        if path.len() > max_depth + 1 {
            return None;
        }

        let parts: Vec<String> = path
            .windows(2)
            .map(|w| {
                let relation = inner
                    .graph
                    .find_edge(w[0], w[1])
                    .map(|e| inner.graph[e].relation.clone())
                    .unwrap_or_else(|| "?".to_string());
                format!(
                    "({}) --[{}]--> ({})",
                    inner.graph[w[0]].name, relation, inner.graph[w[1]].name
                )
            })
            .collect();
        Some(parts.join(" => "))
    }

    /// Entities adjacent (either direction) to both inputs.
    pub fn get_common_neighbors(&self, a: &str, b: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let Some(&a_ix) = inner.node_index.get(&inner.resolve(a)) else {
            return Vec::new();
        };
        let Some(&b_ix) = inner.node_index.get(&inner.resolve(b)) else {
            return Vec::new();
        };

        let around = |ix: NodeIndex| -> HashSet<NodeIndex> {
            inner
                .graph
                .neighbors_directed(ix, Direction::Outgoing)
                .chain(inner.graph.neighbors_directed(ix, Direction::Incoming))
                .collect()
        };
        around(a_ix)
            .intersection(&around(b_ix))
            .map(|&ix| inner.graph[ix].name.clone())
            .collect()
    }

    // ── maintenance ─────────────────────────────────────────────────────────

    /// Fold `other` into `canonical`: edges transfer through the normal
    /// accumulation path, the merged name becomes an alias, its vector moves
    /// over when the canonical has none.
    pub async fn merge_entities(&self, entity1: &str, entity2: &str, canonical: Option<&str>) {
        let canonical = canonical.unwrap_or(entity1).to_string();
        let other = if canonical == entity1 { entity2 } else { entity1 }.to_string();

        // collect the doomed node's edges first, then re-assert them
        let (in_edges, out_edges) = {
            let inner = self.inner.lock().unwrap();
            let Some(&other_ix) = inner.node_index.get(&other) else {
                return;
            };
            let ins: Vec<(String, RelationEdge)> = inner
                .graph
                .edges_directed(other_ix, Direction::Incoming)
                .map(|e| (inner.graph[e.source()].name.clone(), e.weight().clone()))
                .collect();
            let outs: Vec<(String, RelationEdge)> = inner
                .graph
                .edges_directed(other_ix, Direction::Outgoing)
                .map(|e| (inner.graph[e.target()].name.clone(), e.weight().clone()))
                .collect();
            (ins, outs)
        };

        for (source, edge) in in_edges {
            if source != canonical {
                self.add_triplet(&source, &edge.relation, &canonical, &edge.desc, edge.weight)
                    .await;
            }
        }
        for (target, edge) in out_edges {
            if target != canonical {
                self.add_triplet(&canonical, &edge.relation, &target, &edge.desc, edge.weight)
                    .await;
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(ix) = inner.node_index.remove(&other) {
                inner.graph.remove_node(ix);
            }
            if let Some(vec) = inner.node_vectors.remove(&other) {
                inner.node_vectors.entry(canonical.clone()).or_insert(vec);
            }
            self.mark_dirty(&mut inner);
        }
        self.add_alias(&other, &canonical);
        info!(merged = %other, into = %canonical, "entities merged");
    }

    /// Drop edges below the weight floor.
    pub fn prune_weak_edges(&self, min_weight: f64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<_> = inner
            .graph
            .edge_indices()
            .filter(|&e| inner.graph[e].weight < min_weight)
            .collect();
        let count = doomed.len();
        for e in doomed {
            inner.graph.remove_edge(e);
        }
        if count > 0 {
            if let Err(e) = self.save_now(&mut inner) {
                warn!(err = %e, "save after prune failed");
            }
            info!(count, "weak edges pruned");
        }
        count
    }

    /// Drop nodes with no edges in either direction.
    pub fn prune_orphan_nodes(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let orphans: Vec<_> = inner
            .graph
            .node_indices()
            .filter(|&ix| {
                inner
                    .graph
                    .neighbors_directed(ix, Direction::Outgoing)
                    .next()
                    .is_none()
                    && inner
                        .graph
                        .neighbors_directed(ix, Direction::Incoming)
                        .next()
                        .is_none()
            })
            .collect();
        let count = orphans.len();
        for ix in orphans {
            let name = inner.graph[ix].name.clone();
            inner.graph.remove_node(ix);
            inner.node_index.remove(&name);
            inner.node_vectors.remove(&name);
        }
        if count > 0 {
            if let Err(e) = self.save_now(&mut inner) {
                warn!(err = %e, "save after orphan prune failed");
            }
            info!(count, "orphan nodes removed");
        }
        count
    }

    // ── introspection ───────────────────────────────────────────────────────

    pub fn stats(&self) -> GraphStats {
        let inner = self.inner.lock().unwrap();
        let weights: Vec<f64> = inner
            .graph
            .edge_indices()
            .map(|e| inner.graph[e].weight)
            .collect();
        GraphStats {
            nodes: inner.graph.node_count(),
            edges: inner.graph.edge_count(),
            vectors_cached: inner.node_vectors.len(),
            aliases: inner.aliases.len(),
            avg_edge_weight: if weights.is_empty() {
                0.0
            } else {
                weights.iter().sum::<f64>() / weights.len() as f64
            },
            max_edge_weight: weights.iter().cloned().fold(0.0, f64::max),
        }
    }

    /// Node/edge lists for front-end graph rendering.
    pub fn export_for_visualization(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let nodes: Vec<_> = inner
            .graph
            .node_indices()
            .map(|ix| {
                let n = &inner.graph[ix];
                serde_json::json!({ "id": n.name, "label": n.name, "type": n.kind })
            })
            .collect();
        let edges: Vec<_> = inner
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (u, v) = inner.graph.edge_endpoints(e)?;
                let edge = &inner.graph[e];
                Some(serde_json::json!({
                    "from": inner.graph[u].name,
                    "to": inner.graph[v].name,
                    "label": edge.relation,
                    "weight": edge.weight,
                }))
            })
            .collect();
        serde_json::json!({ "nodes": nodes, "edges": edges })
    }

    /// Raw weight of one edge — test and debugging hook.
    pub fn edge(&self, source: &str, target: &str) -> Option<RelationEdge> {
        let inner = self.inner.lock().unwrap();
        let src = *inner.node_index.get(&inner.resolve(source))?;
        let tgt = *inner.node_index.get(&inner.resolve(target))?;
        let e = inner.graph.find_edge(src, tgt)?;
        Some(inner.graph[e].clone())
    }

    pub fn has_node(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let resolved = inner.resolve(name);
        inner.node_index.contains_key(&resolved)
    }

    /// Exact-name probe that skips alias resolution.
    pub fn has_literal_node(&self, name: &str) -> bool {
        self.inner.lock().unwrap().node_index.contains_key(name)
    }
}

fn format_edge(u: &str, v: &str, edge: &RelationEdge) -> String {
    let weight_tag = if edge.weight >= 3.0 {
        "[强关系]"
    } else if edge.weight >= 2.0 {
        "[中关系]"
    } else {
        ""
    };
    let mut line = format!("{weight_tag}({u}) --[{}]--> ({v})", edge.relation);
    if !edge.desc.is_empty() {
        line.push_str(&format!(" | {}", edge.desc));
    }
    line
}

/// Keyword relevance: exact 1.0, substring 0.8 / 0.6, token overlap × 0.5.
fn keyword_match_score(query: &str, node: &str) -> f32 {
    let query_lower = query.to_lowercase();
    let node_lower = node.to_lowercase();

    if query_lower == node_lower {
        return 1.0;
    }
    if node_lower.contains(&query_lower) {
        return 0.8;
    }
    if query_lower.contains(&node_lower) {
        return 0.6;
    }

    let query_words: HashSet<&str> = query_lower.split_whitespace().collect();
    let node_words: HashSet<&str> = node_lower.split_whitespace().collect();
    let overlap = query_words.intersection(&node_words).count();
    if overlap > 0 {
        let total = query_words.union(&node_words).count();
        return 0.5 * overlap as f32 / total as f32;
    }
    0.0
}

#[derive(serde::Serialize, serde::Deserialize)]
struct VectorFile {
    vectors: BTreeMap<String, Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (GraphStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path(), None).unwrap();
        store.switch_session("test-session");
        (store, dir)
    }

    #[tokio::test]
    async fn repeated_assertions_accumulate() {
        let (store, _dir) = store();
        store
            .add_triplet("Alice", "hates", "Bob", "first fight", 1.0)
            .await;
        store
            .add_triplet("Alice", "loathes", "Bob", "second fight", 1.0)
            .await;

        let edge = store.edge("Alice", "Bob").unwrap();
        assert_eq!(edge.weight, 2.0);
        assert_eq!(edge.relation, "hates");
        assert!(edge.relations.contains("hates") && edge.relations.contains("loathes"));
        assert!(edge.descriptions.contains("first fight"));
        assert!(edge.descriptions.contains("second fight"));
        assert_eq!(edge.desc, "first fight");
    }

    #[tokio::test]
    async fn aliases_resolve_before_insert() {
        let (store, _dir) = store();
        store.add_alias("alice", "Alice");
        store.add_triplet("ALICE", "knows", "Carol", "", 1.0).await;

        assert!(store.has_node("Alice"));
        assert!(!store.has_literal_node("ALICE"));
        assert!(store.edge("Alice", "Carol").is_some());
    }

    #[test]
    fn alias_resolution_is_idempotent() {
        let (store, _dir) = store();
        store.add_alias("爱丽丝", "Alice");
        let once = store.resolve_entity("爱丽丝");
        let twice = store.resolve_entity(&once);
        assert_eq!(once, "Alice");
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn subgraph_dedups_and_filters_by_weight() {
        let (store, _dir) = store();
        store.add_triplet("Alice", "knows", "Bob", "", 1.0).await;
        store.add_triplet("Alice", "knows", "Bob", "", 1.0).await;
        store.add_triplet("Alice", "owns", "Dagger", "", 0.4).await;

        let out = store.search_subgraph("Alice", 5, 1, 0.5).await;
        // the doubled edge appears once, the light edge not at all
        assert_eq!(out.matches("--[knows]-->").count(), 1);
        assert!(!out.contains("Dagger"));
        assert!(out.contains("[中关系](Alice) --[knows]--> (Bob)"));
    }

    #[tokio::test]
    async fn subgraph_includes_edges_between_neighbors() {
        let (store, _dir) = store();
        store.add_triplet("Alice", "knows", "Bob", "", 1.0).await;
        store.add_triplet("Alice", "knows", "Carol", "", 1.0).await;
        store.add_triplet("Bob", "loves", "Carol", "", 1.0).await;

        let out = store.search_subgraph("Alice", 5, 1, 0.0).await;
        assert!(out.contains("--[loves]-->"));
    }

    #[tokio::test]
    async fn path_finding_respects_direction_and_depth() {
        let (store, _dir) = store();
        store.add_triplet("A", "knows", "B", "", 1.0).await;
        store.add_triplet("B", "knows", "C", "", 1.0).await;
        store.add_triplet("C", "knows", "D", "", 1.0).await;

        let path = store.find_path("A", "C", 3).unwrap();
        assert_eq!(path, "(A) --[knows]--> (B) => (B) --[knows]--> (C)");

        assert!(store.find_path("A", "D", 2).is_none());
        assert!(store.find_path("D", "A", 3).is_none());
        assert!(store.find_path("A", "Nobody", 3).is_none());
    }

    #[tokio::test]
    async fn cycles_are_handled() {
        let (store, _dir) = store();
        store.add_triplet("A", "knows", "B", "", 1.0).await;
        store.add_triplet("B", "knows", "A", "", 1.0).await;
        store.add_triplet("B", "knows", "C", "", 1.0).await;

        assert!(store.find_path("A", "C", 3).is_some());
        let out = store.search_subgraph("A", 5, 2, 0.0).await;
        assert!(out.contains("(A) --[knows]--> (B)"));
        assert!(out.contains("(B) --[knows]--> (A)"));
    }

    #[tokio::test]
    async fn merge_transfers_edges_and_registers_alias() {
        let (store, _dir) = store();
        store.add_triplet("Alicia", "owns", "Sword", "", 1.0).await;
        store.add_triplet("Bob", "trusts", "Alicia", "", 1.0).await;
        store.add_triplet("Alice", "knows", "Bob", "", 1.0).await;

        store.merge_entities("Alice", "Alicia", Some("Alice")).await;

        assert!(!store.has_literal_node("Alicia"));
        assert!(store.edge("Alice", "Sword").is_some());
        assert!(store.edge("Bob", "Alice").is_some());
        assert_eq!(store.resolve_entity("alicia"), "Alice");
    }

    #[tokio::test]
    async fn pruning_weak_edges_and_orphans() {
        let (store, _dir) = store();
        store.add_triplet("A", "barely", "B", "", 0.2).await;
        store.add_triplet("A", "firmly", "C", "", 2.0).await;

        assert_eq!(store.prune_weak_edges(0.5), 1);
        assert!(store.edge("A", "B").is_none());
        // B is now edgeless
        assert_eq!(store.prune_orphan_nodes(), 1);
        assert!(!store.has_literal_node("B"));
        assert!(store.has_literal_node("A"));
    }

    #[tokio::test]
    async fn entity_relations_sorted_by_weight() {
        let (store, _dir) = store();
        store.add_triplet("Alice", "knows", "Bob", "", 1.0).await;
        store.add_triplet("Alice", "loves", "Carol", "", 1.0).await;
        store.add_triplet("Alice", "loves", "Carol", "", 1.0).await;
        store.add_triplet("Dan", "envies", "Alice", "", 1.0).await;

        let rels = store.get_entity_relations("Alice");
        assert_eq!(rels.outgoing[0].entity, "Carol");
        assert_eq!(rels.outgoing[1].entity, "Bob");
        assert_eq!(rels.incoming[0].entity, "Dan");
    }

    #[tokio::test]
    async fn common_neighbors_ignore_direction() {
        let (store, _dir) = store();
        store.add_triplet("Alice", "knows", "Carol", "", 1.0).await;
        store.add_triplet("Carol", "serves", "Bob", "", 1.0).await;
        store.add_triplet("Alice", "owns", "Sword", "", 1.0).await;

        let common = store.get_common_neighbors("Alice", "Bob");
        assert_eq!(common, vec!["Carol".to_string()]);
    }

    #[tokio::test]
    async fn save_load_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path(), None).unwrap();
        store.switch_session("rt");
        store
            .add_triplet("Alice", "hates", "Bob", "fight", 1.0)
            .await;
        store.add_alias("alicia", "Alice");
        store.flush();

        let vectors_path = dir.path().join("vectors").join("vectors_rt.json");
        let first = std::fs::read(&vectors_path).unwrap();

        let store2 = GraphStore::new(dir.path(), None).unwrap();
        store2.switch_session("rt");
        let edge = store2.edge("Alice", "Bob").unwrap();
        assert_eq!(edge.weight, 1.0);
        assert_eq!(store2.resolve_entity("alicia"), "Alice");

        // re-saving the unchanged graph is byte-identical
        {
            let mut inner = store2.inner.lock().unwrap();
            store2.save_now(&mut inner).unwrap();
        }
        let second = std::fs::read(&vectors_path).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn delete_graph_removes_files_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path(), None).unwrap();
        store.switch_session("doomed");
        store.add_triplet("A", "knows", "B", "", 1.0).await;
        store.flush();
        assert!(dir.path().join("graph_doomed.json").exists());

        store.delete_graph("doomed");
        assert!(!dir.path().join("graph_doomed.json").exists());
        assert_eq!(store.stats().nodes, 0);
    }

    #[test]
    fn keyword_scoring_tiers() {
        assert_eq!(keyword_match_score("alice", "Alice"), 1.0);
        assert_eq!(keyword_match_score("ali", "Alice"), 0.8);
        assert_eq!(keyword_match_score("Alice the brave", "alice"), 0.6);
        let jaccard = keyword_match_score("dark cave entrance", "cave troll");
        assert!(jaccard > 0.0 && jaccard < 0.5);
        assert_eq!(keyword_match_score("xyz", "Alice"), 0.0);
    }
}
