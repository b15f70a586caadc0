//! Fan-out of a node template over a list of configuration entries
//!
//! One node is produced per entry. Each node shares the template's kind,
//! creation operation, shared inputs and dependencies; entry fields are bound
//! to per-node literal inputs. A malformed entry does not abort the whole
//! fan-out: it yields a node that starts Failed, so the remaining entries are
//! still provisioned and the failure shows up in the run report.
//!
//! Entry names must be DNS labels. A rejected entry without a usable name is
//! keyed `{prefix}#{index}`, which no valid name can produce.

use std::collections::BTreeMap;
use std::sync::Arc;

use keystone_common::kube_utils::is_dns_label;
use serde_json::Value;
use tracing::warn;

use crate::error::{GraphError, NodeError};
use crate::graph::{DependencyGraph, EdgeKind};
use crate::node::{CreateOperation, InputValue, ResourceKind, ResourceNode};

/// Maps an entry field onto a node input
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldBinding {
    field: String,
    input: String,
}

/// Entry field that names the generated node
const ID_FIELD: &str = "name";

/// Template from which one node per entry is generated
pub struct FanOutTemplate {
    id_prefix: String,
    kind: ResourceKind,
    bindings: Vec<FieldBinding>,
    inputs: BTreeMap<String, InputValue>,
    dependencies: Vec<(String, EdgeKind)>,
    operation: Arc<dyn CreateOperation>,
}

/// Nodes generated by a fan-out
#[derive(Debug, Default)]
pub struct FanOut {
    /// One node per entry, rejected entries included
    pub nodes: Vec<ResourceNode>,
    /// Why each rejected entry was rejected
    pub malformed: Vec<GraphError>,
}

impl FanOut {
    /// Add every generated node to `graph`
    pub fn add_to(self, graph: &mut DependencyGraph) -> Result<Vec<GraphError>, GraphError> {
        for node in self.nodes {
            graph.add_node(node)?;
        }
        Ok(self.malformed)
    }
}

impl FanOutTemplate {
    /// Template producing nodes with ids `{id_prefix}{name}`
    pub fn new(
        id_prefix: impl Into<String>,
        kind: ResourceKind,
        operation: Arc<dyn CreateOperation>,
    ) -> Self {
        Self {
            id_prefix: id_prefix.into(),
            kind,
            bindings: Vec::new(),
            inputs: BTreeMap::new(),
            dependencies: Vec::new(),
            operation,
        }
    }

    /// Bind a required entry field to an input
    pub fn bind(mut self, field: impl Into<String>, input: impl Into<String>) -> Self {
        self.bindings.push(FieldBinding {
            field: field.into(),
            input: input.into(),
        });
        self
    }

    /// Input shared by every generated node
    pub fn with_input(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Dependency shared by every generated node
    pub fn with_dependency(mut self, id: impl Into<String>, kind: EdgeKind) -> Self {
        self.dependencies.push((id.into(), kind));
        self
    }

    fn node_id(&self, index: usize, entry: &Value) -> String {
        match entry.get(ID_FIELD).and_then(Value::as_str) {
            Some(name) if is_dns_label(name) => format!("{}{}", self.id_prefix, name),
            _ => format!("{}#{}", self.id_prefix, index),
        }
    }

    fn check_entry(&self, index: usize, entry: &Value) -> Result<BTreeMap<String, Value>, GraphError> {
        let malformed = |reason: String| GraphError::MalformedEntry { index, reason };
        let fields = entry
            .as_object()
            .ok_or_else(|| malformed("entry is not a mapping".to_string()))?;

        let present = |field: &str| {
            fields
                .get(field)
                .filter(|v| !v.is_null() && v.as_str() != Some(""))
        };
        let name = present(ID_FIELD)
            .ok_or_else(|| malformed(format!("missing field {}", ID_FIELD)))?;
        match name.as_str() {
            Some(name) if is_dns_label(name) => {}
            _ => return Err(malformed(format!("invalid {} {}", ID_FIELD, name))),
        }

        let mut bound = BTreeMap::new();
        for binding in &self.bindings {
            let value = present(&binding.field)
                .ok_or_else(|| malformed(format!("missing field {}", binding.field)))?;
            bound.insert(binding.input.clone(), value.clone());
        }
        Ok(bound)
    }

    fn build(&self, id: String, bound: BTreeMap<String, Value>) -> ResourceNode {
        let mut node = ResourceNode::new(id, self.kind, Arc::clone(&self.operation));
        for (name, value) in &self.inputs {
            node = node.with_input(name.clone(), value.clone());
        }
        for (name, value) in bound {
            node = node.with_literal(name, value);
        }
        for (dependency, kind) in &self.dependencies {
            node = node.with_dependency(dependency.clone(), *kind);
        }
        node
    }

    /// One node per entry. Malformed entries yield nodes that start Failed.
    ///
    /// An empty entry list yields no nodes.
    pub fn expand(&self, entries: &[Value]) -> FanOut {
        let mut out = FanOut::default();
        for (index, entry) in entries.iter().enumerate() {
            let id = self.node_id(index, entry);
            match self.check_entry(index, entry) {
                Ok(bound) => out.nodes.push(self.build(id, bound)),
                Err(e) => {
                    warn!(node = %id, error = %e, "Rejecting malformed entry");
                    let cause = NodeError::from(e.clone());
                    let mut rejected = ResourceNode::rejected(id, self.kind, cause);
                    for (dependency, kind) in &self.dependencies {
                        rejected = rejected.with_dependency(dependency.clone(), *kind);
                    }
                    out.nodes.push(rejected);
                    out.malformed.push(e);
                }
            }
        }
        out
    }
}
