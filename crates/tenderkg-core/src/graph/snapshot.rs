use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use super::store::{Direction, TraversalHit};
use crate::chunk::Chunk;
use crate::entity::{Attributes, EntityKey};
use crate::relation::{Mention, RelationKey, RelationType};

/// Stored entity content that takes part in graph equality.
/// Timestamps are deliberately left out.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub display_name: String,
    pub confidence: f64,
    pub attributes: Attributes,
}

/// Full, comparable content of a graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    pub chunks: BTreeMap<String, Chunk>,
    pub entities: BTreeMap<EntityKey, EntityState>,
    /// Relation triple -> confidence.
    pub relations: BTreeMap<RelationKey, f64>,
    pub mentions: BTreeSet<Mention>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Chunk(String),
    Entity(EntityKey),
}

/// In-memory `petgraph` view of a [`GraphState`] for audits and offline traversal.
pub struct GraphSnapshot {
    graph: DiGraph<Node, RelationType>,
    entities: HashMap<EntityKey, NodeIndex>,
}

impl GraphSnapshot {
    #[must_use]
    pub fn from_state(state: &GraphState) -> Self {
        let mut graph = DiGraph::new();
        let mut entities = HashMap::new();
        let mut chunks = HashMap::new();

        for id in state.chunks.keys() {
            chunks.insert(id.clone(), graph.add_node(Node::Chunk(id.clone())));
        }
        for key in state.entities.keys() {
            entities.insert(key.clone(), graph.add_node(Node::Entity(key.clone())));
        }
        for key in state.relations.keys() {
            if let (Some(&s), Some(&t)) = (entities.get(&key.source), entities.get(&key.target)) {
                graph.add_edge(s, t, key.relation_type);
            }
        }
        for mention in &state.mentions {
            if let (Some(&c), Some(&e)) = (chunks.get(&mention.chunk_id), entities.get(&mention.entity)) {
                graph.add_edge(c, e, RelationType::Mentions);
            }
        }

        Self { graph, entities }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Entities with no incoming `MENTIONS` edge, sorted by key.
    #[must_use]
    pub fn orphans(&self) -> Vec<EntityKey> {
        let mut orphans: Vec<EntityKey> = self
            .entities
            .iter()
            .filter(|&(_, &idx)| {
                !self
                    .graph
                    .edges_directed(idx, petgraph::Direction::Incoming)
                    .any(|e| *e.weight() == RelationType::Mentions)
            })
            .map(|(key, _)| key.clone())
            .collect();
        orphans.sort();
        orphans
    }

    /// Chunk ids that mention `key`, sorted.
    #[must_use]
    pub fn mentioning_chunks(&self, key: &EntityKey) -> Vec<String> {
        let Some(&idx) = self.entities.get(key) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = self
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .filter(|e| *e.weight() == RelationType::Mentions)
            .filter_map(|e| match &self.graph[e.source()] {
                Node::Chunk(id) => Some(id.clone()),
                Node::Entity(_) => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// Breadth-first traversal over entity-to-entity edges. Hits are sorted
    /// by depth, then key. An empty type list means every type.
    #[must_use]
    pub fn neighbors(
        &self,
        start: &EntityKey,
        relation_types: &[RelationType],
        direction: Direction,
        depth: u32,
    ) -> Vec<TraversalHit> {
        let Some(&origin) = self.entities.get(start) else {
            return Vec::new();
        };
        let allowed = |t: RelationType| {
            t != RelationType::Mentions && (relation_types.is_empty() || relation_types.contains(&t))
        };

        let mut visited: HashSet<NodeIndex> = HashSet::from([origin]);
        let mut queue = VecDeque::from([(origin, 0u32)]);
        let mut hits = Vec::new();

        while let Some((node, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            let mut next = Vec::new();
            if matches!(direction, Direction::Outgoing | Direction::Both) {
                next.extend(
                    self.graph
                        .edges_directed(node, petgraph::Direction::Outgoing)
                        .filter(|e| allowed(*e.weight()))
                        .map(|e| e.target()),
                );
            }
            if matches!(direction, Direction::Incoming | Direction::Both) {
                next.extend(
                    self.graph
                        .edges_directed(node, petgraph::Direction::Incoming)
                        .filter(|e| allowed(*e.weight()))
                        .map(|e| e.source()),
                );
            }
            for n in next {
                if !visited.insert(n) {
                    continue;
                }
                if let Node::Entity(key) = &self.graph[n] {
                    hits.push(TraversalHit {
                        key: key.clone(),
                        depth: level + 1,
                    });
                }
                queue.push_back((n, level + 1));
            }
        }

        hits.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));
        hits
    }
}
