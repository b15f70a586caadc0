//! Dependency graph of resource nodes
//!
//! Edges run from producer to consumer. Each edge carries a kind that decides
//! when the consumer may start:
//!
//! | kind        | consumer may start once the producer is |
//! |-------------|------------------------------------------|
//! | `Explicit`  | created (AwaitingReadiness or Ready)     |
//! | `Data`      | Ready                                    |
//! | `Readiness` | Ready                                    |
//!
//! A data consumer never reads outputs of a producer whose barrier is still
//! pending. `Explicit` is the only existence-level dependency.
//!
//! Cycles are rejected when the closing edge is added, so a graph that was
//! built without error can always be ordered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{GraphError, NodeError};
use crate::node::{InputValue, NodeState, NodeView, ResourceNode};

/// Why a consumer waits on a producer. Ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// Declared ordering constraint
    Explicit,
    /// Consumer reads one of the producer's outputs
    Data,
    /// Consumer needs the producer's readiness barrier satisfied
    Readiness,
}

impl EdgeKind {
    /// Whether a producer in `state` satisfies an edge of this kind
    pub fn satisfied_by(&self, state: NodeState) -> bool {
        match self {
            EdgeKind::Explicit => state.is_created(),
            EdgeKind::Data | EdgeKind::Readiness => state == NodeState::Ready,
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeKind::Explicit => "explicit",
            EdgeKind::Data => "data",
            EdgeKind::Readiness => "readiness",
        })
    }
}

/// An edge whose producer has not been added yet
#[derive(Debug, Clone)]
struct PendingEdge {
    producer: String,
    consumer: String,
    kind: EdgeKind,
}

/// Directed acyclic graph of [`ResourceNode`]s keyed by id
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, ResourceNode>,
    /// consumer -> producer -> edge kind
    producers: BTreeMap<String, BTreeMap<String, EdgeKind>>,
    /// producer -> consumers
    consumers: BTreeMap<String, BTreeSet<String>>,
    /// Declared edges whose producer is not in the graph yet
    pending: Vec<PendingEdge>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node together with the edges it declares.
    ///
    /// Edges to producers that are already present are linked immediately;
    /// edges to producers added later are linked when those arrive. On error
    /// the graph is left unchanged.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        let id = node.id().to_string();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateId(id));
        }
        if let Some(barrier_kind) = node.barrier().map(|_| node.kind()) {
            if !barrier_kind.supports_barrier() {
                return Err(GraphError::BarrierNotSupported {
                    id,
                    kind: barrier_kind,
                });
            }
        }

        let declared = node.declared_edges();
        if declared.contains_key(&id) {
            return Err(GraphError::SelfDependency(id));
        }

        self.nodes.insert(id.clone(), node);
        self.producers.entry(id.clone()).or_default();
        self.consumers.entry(id.clone()).or_default();

        let mut to_link: Vec<PendingEdge> = Vec::new();
        let mut deferred: Vec<PendingEdge> = Vec::new();
        for (producer, kind) in declared {
            let edge = PendingEdge {
                producer,
                consumer: id.clone(),
                kind,
            };
            if self.nodes.contains_key(&edge.producer) {
                to_link.push(edge);
            } else {
                deferred.push(edge);
            }
        }
        let (arrived, still_pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|e| e.producer == id);
        self.pending = still_pending;
        to_link.extend(arrived.iter().cloned());

        for edge in &to_link {
            if let Err(e) = self.link(&edge.producer, &edge.consumer, edge.kind) {
                self.remove_node(&id);
                self.pending.extend(arrived);
                return Err(e);
            }
        }
        self.pending.extend(deferred);
        Ok(())
    }

    /// Add an edge between two nodes already in the graph.
    ///
    /// Adding the same edge twice is a no-op; adding a weaker kind over a
    /// stronger one keeps the stronger.
    pub fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) -> Result<(), GraphError> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::UnknownNode(id.to_string()));
            }
        }
        if from == to {
            return Err(GraphError::SelfDependency(from.to_string()));
        }
        self.link(from, to, kind)
    }

    fn link(&mut self, from: &str, to: &str, kind: EdgeKind) -> Result<(), GraphError> {
        if let Some(path) = self.path_between(to, from) {
            let mut cycle = path;
            cycle.push(to.to_string());
            return Err(GraphError::CycleDetected(cycle.join(" -> ")));
        }

        let entry = self
            .producers
            .entry(to.to_string())
            .or_default()
            .entry(from.to_string())
            .or_insert(kind);
        *entry = (*entry).max(kind);
        self.consumers
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        debug!(from = %from, to = %to, kind = %kind, "linked edge");
        Ok(())
    }

    /// Shortest producer->consumer path from `start` to `goal`, if any
    fn path_between(&self, start: &str, goal: &str) -> Option<Vec<String>> {
        let mut came_from: BTreeMap<&str, &str> = BTreeMap::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        let mut seen: BTreeSet<&str> = BTreeSet::from([start]);

        while let Some(current) = queue.pop_front() {
            if current == goal {
                let mut path = vec![goal.to_string()];
                let mut cursor = goal;
                while let Some(&prev) = came_from.get(cursor) {
                    path.push(prev.to_string());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.consumers.get(current).into_iter().flatten() {
                if seen.insert(next.as_str()) {
                    came_from.insert(next.as_str(), current);
                    queue.push_back(next.as_str());
                }
            }
        }
        None
    }

    fn remove_node(&mut self, id: &str) {
        self.nodes.remove(id);
        if let Some(producers) = self.producers.remove(id) {
            for producer in producers.keys() {
                if let Some(c) = self.consumers.get_mut(producer) {
                    c.remove(id);
                }
            }
        }
        if let Some(consumers) = self.consumers.remove(id) {
            for consumer in consumers {
                if let Some(p) = self.producers.get_mut(&consumer) {
                    p.remove(id);
                }
            }
        }
    }

    /// Fail if any declared edge still points at a node that was never added
    pub fn check_complete(&self) -> Result<(), GraphError> {
        match self.pending.first() {
            Some(edge) => Err(GraphError::UnknownNode(edge.producer.clone())),
            None => Ok(()),
        }
    }

    /// Look up a node
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ResourceNode> {
        self.nodes.get_mut(id)
    }

    /// Whether a node with this id exists
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All node ids in ascending order
    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Iterate nodes in ascending id order
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Producers of `id` with the edge kind to each
    pub fn producers_of(&self, id: &str) -> impl Iterator<Item = (&str, EdgeKind)> {
        self.producers
            .get(id)
            .into_iter()
            .flatten()
            .map(|(p, k)| (p.as_str(), *k))
    }

    /// Direct consumers of `id`
    pub fn consumers_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.consumers
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Edge kind from `from` to `to`, if they are directly connected
    pub fn edge(&self, from: &str, to: &str) -> Option<EdgeKind> {
        self.producers.get(to).and_then(|p| p.get(from)).copied()
    }

    /// Every node reachable from `id` through consumer edges
    pub fn transitive_consumers(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.consumers_of(id).collect();
        while let Some(next) = queue.pop_front() {
            if found.insert(next.to_string()) {
                queue.extend(self.consumers_of(next));
            }
        }
        found
    }

    /// Whether every incoming edge of `id` is satisfied by its producer's state
    pub fn dependencies_satisfied(&self, id: &str) -> bool {
        self.producers_of(id).all(|(producer, kind)| {
            self.nodes
                .get(producer)
                .is_some_and(|p| kind.satisfied_by(p.state()))
        })
    }

    /// First producer of `id` that is Failed, if any
    pub fn failed_producer(&self, id: &str) -> Option<&str> {
        self.producers_of(id)
            .map(|(producer, _)| producer)
            .find(|producer| {
                self.nodes
                    .get(*producer)
                    .is_some_and(|p| p.state() == NodeState::Failed)
            })
    }

    /// Build the view a creation operation sees, resolving output references
    /// against producer outputs.
    pub fn resolve_inputs(&self, id: &str) -> Result<NodeView, NodeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| NodeError::Aborted(format!("unknown node {}", id)))?;

        let mut inputs: BTreeMap<String, Value> = BTreeMap::new();
        for (name, value) in node.inputs() {
            let resolved = match value {
                InputValue::Literal(v) => v.clone(),
                InputValue::Ref(r) => self
                    .nodes
                    .get(&r.producer)
                    .and_then(|p| p.outputs())
                    .and_then(|outputs| outputs.get(&r.output))
                    .cloned()
                    .ok_or_else(|| NodeError::UnresolvedInput {
                        producer: r.producer.clone(),
                        output: r.output.clone(),
                    })?,
            };
            inputs.insert(name.clone(), resolved);
        }

        Ok(NodeView {
            id: id.to_string(),
            inputs,
            outputs: node.outputs().cloned().unwrap_or_default(),
        })
    }
}
