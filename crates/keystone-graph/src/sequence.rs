//! Topological ordering of a dependency graph
//!
//! The order is computed as a sequence of ready sets: every node in set N has
//! all of its producers in sets 0..N-1, so the members of one set have no
//! ordering constraint between them. Within a set, ids are ascending, which
//! makes the order deterministic for a given graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use tracing::{debug, info};

use crate::error::GraphError;
use crate::graph::DependencyGraph;

/// Nodes whose producers are all in earlier groups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionGroup {
    /// Node ids in ascending order
    pub ids: Vec<String>,
}

impl ProvisionGroup {
    /// Check if the group is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of nodes in the group
    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Ordered ready sets for a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSequence {
    groups: Vec<ProvisionGroup>,
    total_nodes: usize,
}

impl ProvisionSequence {
    /// Compute the sequence using Kahn's algorithm.
    ///
    /// Fails with `UnknownNode` if a declared dependency was never added and
    /// with `CycleDetected` if no progress can be made.
    pub fn from_graph(graph: &DependencyGraph) -> Result<Self, GraphError> {
        graph.check_complete()?;

        let mut remaining: BTreeMap<String, usize> = graph
            .ids()
            .into_iter()
            .map(|id| {
                let in_degree = graph.producers_of(&id).count();
                (id, in_degree)
            })
            .collect();
        let total_nodes = remaining.len();
        let mut groups: Vec<ProvisionGroup> = Vec::new();

        while !remaining.is_empty() {
            let ids: Vec<String> = remaining
                .iter()
                .filter(|(_, in_degree)| **in_degree == 0)
                .map(|(id, _)| id.clone())
                .collect();

            if ids.is_empty() {
                let stuck: Vec<&str> = remaining.keys().map(String::as_str).collect();
                return Err(GraphError::CycleDetected(format!(
                    "cannot make progress, stuck nodes: {}",
                    stuck.join(", ")
                )));
            }

            for id in &ids {
                remaining.remove(id);
                for consumer in graph.consumers_of(id) {
                    if let Some(in_degree) = remaining.get_mut(consumer) {
                        *in_degree = in_degree.saturating_sub(1);
                    }
                }
            }

            debug!(group = groups.len(), nodes = ids.len(), "Computed ready set");
            groups.push(ProvisionGroup { ids });
        }

        info!(
            groups = groups.len(),
            nodes = total_nodes,
            "Computed provisioning order"
        );

        Ok(Self {
            groups,
            total_nodes,
        })
    }

    /// The ordered ready sets
    pub fn groups(&self) -> &[ProvisionGroup] {
        &self.groups
    }

    /// Total number of nodes
    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// Number of ready sets
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// All ids in provisioning order (flattened)
    pub fn all_ids_in_order(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.ids.iter().cloned())
            .collect()
    }

    /// Position of each id in the flattened order
    pub fn ranks(&self) -> BTreeMap<String, usize> {
        self.all_ids_in_order()
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank))
            .collect()
    }

    /// Index of the group containing `id`
    pub fn group_of(&self, id: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.ids.iter().any(|member| member == id))
    }

    /// Render the sequence as an indented plan, one group per block
    pub fn render(&self, graph: &DependencyGraph) -> String {
        let mut out = String::new();
        for (index, group) in self.groups.iter().enumerate() {
            let _ = writeln!(out, "[{}]", index);
            for id in &group.ids {
                let kind = graph
                    .get(id)
                    .map(|n| n.kind().to_string())
                    .unwrap_or_default();
                let waits: BTreeSet<String> = graph
                    .producers_of(id)
                    .map(|(producer, edge)| format!("{} ({})", producer, edge))
                    .collect();
                if waits.is_empty() {
                    let _ = writeln!(out, "  {} [{}]", id, kind);
                } else {
                    let waits: Vec<String> = waits.into_iter().collect();
                    let _ = writeln!(out, "  {} [{}] <- {}", id, kind, waits.join(", "));
                }
            }
        }
        out
    }
}
