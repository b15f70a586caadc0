//! Error types for graph construction and provisioning runs

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::executor::CompletedGraph;
use crate::node::{NodeState, ResourceKind};

/// Errors raised while building or validating a dependency graph.
///
/// All of these are detected before any creation operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A node with this id was already added
    #[error("duplicate node id: {0}")]
    DuplicateId(String),

    /// An edge or input reference names a node that is not in the graph
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A node lists itself as a dependency
    #[error("node {0} depends on itself")]
    SelfDependency(String),

    /// Adding an edge would close a cycle
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A fan-out entry is missing a required field
    #[error("malformed entry #{index}: {reason}")]
    MalformedEntry {
        /// Position of the entry in its source list
        index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// A readiness barrier was attached to a kind that cannot carry one
    #[error("node {id} of kind {kind} cannot carry a readiness barrier")]
    BarrierNotSupported {
        /// Node id
        id: String,
        /// Kind of the node
        kind: ResourceKind,
    },

    /// A state change outside the node lifecycle was requested
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        /// Node id
        id: String,
        /// Current state
        from: NodeState,
        /// Requested state
        to: NodeState,
    },
}

/// Why a single node ended up Failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The creation operation reported an error
    #[error("creation failed: {message}")]
    CreationFailed {
        /// Error reported by the collaborator
        message: String,
        /// Whether another attempt could succeed
        retryable: bool,
    },

    /// The readiness barrier did not become true within its maximum wait
    #[error("readiness barrier timed out after {}s", .waited.as_secs())]
    BarrierTimeout {
        /// How long the barrier was awaited
        waited: Duration,
    },

    /// The readiness predicate observed an unrecoverable failure
    #[error("readiness barrier failed: {message}")]
    BarrierFailed {
        /// What the predicate observed
        message: String,
    },

    /// A data input could not be resolved from its producer's outputs
    #[error("unresolved input: {producer}.{output}")]
    UnresolvedInput {
        /// Producer node id
        producer: String,
        /// Output name on the producer
        output: String,
    },

    /// An input required by the operation was not supplied
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A dependency failed, so this node was never attempted
    #[error("dependency {dependency} failed")]
    DependencyFailed {
        /// Id of the failed dependency
        dependency: String,
    },

    /// The fan-out entry this node was generated from is malformed
    #[error("malformed entry #{index}: {reason}")]
    MalformedEntry {
        /// Position of the entry in its source list
        index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// The node's task ended without reporting a result
    #[error("task aborted: {0}")]
    Aborted(String),
}

impl NodeError {
    /// Create a creation failure that may succeed on another attempt
    pub fn creation_failed(msg: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a creation failure that no retry can fix
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a barrier failure
    pub fn barrier_failed(msg: impl Into<String>) -> Self {
        Self::BarrierFailed {
            message: msg.into(),
        }
    }

    /// True when the node failed only because something upstream did
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, NodeError::DependencyFailed { .. })
    }

    /// Whether the executor may attempt the creation again.
    ///
    /// Only creation failures flagged retryable qualify; missing or
    /// unresolved inputs fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::CreationFailed { retryable: true, .. })
    }
}

impl From<keystone_common::Error> for NodeError {
    fn from(e: keystone_common::Error) -> Self {
        NodeError::CreationFailed {
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<GraphError> for NodeError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::MalformedEntry { index, reason } => {
                NodeError::MalformedEntry { index, reason }
            }
            other => NodeError::Aborted(other.to_string()),
        }
    }
}

/// A node that ended a run in the Failed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// Node id
    pub id: String,
    /// Node kind
    pub kind: ResourceKind,
    /// Why it failed
    pub cause: NodeError,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.id, self.kind, self.cause)
    }
}

/// Outcome of a run that did not bring every node to Ready
#[derive(Debug)]
pub struct FailedRun {
    /// Nodes whose own operation or barrier failed
    pub failures: Vec<NodeFailure>,
    /// Nodes never attempted because a dependency failed
    pub poisoned: Vec<NodeFailure>,
    /// Nodes left Pending because the run was cancelled
    pub abandoned: Vec<String>,
    /// Whether the run was cancelled
    pub cancelled: bool,
    /// Final graph state and transition trace
    pub completed: CompletedGraph,
}

impl fmt::Display for FailedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancelled {
            write!(f, "provisioning cancelled")?;
        } else {
            write!(f, "provisioning failed")?;
        }
        if !self.failures.is_empty() {
            let roots: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
            write!(f, ": {}", roots.join("; "))?;
        }
        if !self.poisoned.is_empty() {
            write!(f, " ({} dependent node(s) skipped)", self.poisoned.len())?;
        }
        if !self.abandoned.is_empty() {
            write!(f, " ({} node(s) never started)", self.abandoned.len())?;
        }
        Ok(())
    }
}

/// Errors returned by [`Executor::run`](crate::executor::Executor::run)
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The graph could not be ordered; nothing was executed
    #[error("invalid graph: {0}")]
    InvalidGraph(#[from] GraphError),

    /// At least one node did not reach Ready
    #[error("{0}")]
    Failed(Box<FailedRun>),
}

impl ExecutionError {
    /// Root failures, or an empty slice for graph errors
    pub fn failures(&self) -> &[NodeFailure] {
        match self {
            ExecutionError::Failed(run) => &run.failures,
            ExecutionError::InvalidGraph(_) => &[],
        }
    }

    /// The failed run, if execution got that far
    pub fn failed_run(&self) -> Option<&FailedRun> {
        match self {
            ExecutionError::Failed(run) => Some(run),
            ExecutionError::InvalidGraph(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        assert_eq!(
            GraphError::DuplicateId("eks-cluster".into()).to_string(),
            "duplicate node id: eks-cluster"
        );
        assert_eq!(
            GraphError::CycleDetected("a -> b -> a".into()).to_string(),
            "cycle detected: a -> b -> a"
        );
        let err = GraphError::IllegalTransition {
            id: "job".into(),
            from: NodeState::Ready,
            to: NodeState::Creating,
        };
        assert_eq!(err.to_string(), "illegal transition for job: ready -> creating");
    }

    #[test]
    fn node_error_display() {
        let err = NodeError::BarrierTimeout {
            waited: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "readiness barrier timed out after 600s");

        let err = NodeError::UnresolvedInput {
            producer: "eks-cluster".into(),
            output: "kubeconfig".into(),
        };
        assert_eq!(err.to_string(), "unresolved input: eks-cluster.kubeconfig");
    }

    #[test]
    fn collaborator_errors_become_creation_failures() {
        let err: NodeError = keystone_common::Error::provider("aws", "throttled").into();
        assert_eq!(
            err,
            NodeError::creation_failed("provider error [aws]: throttled")
        );
        assert!(!err.is_dependency_failure());
        assert!(err.is_retryable());

        let err: NodeError =
            keystone_common::Error::provider_permanent("aws", "AccessDenied").into();
        assert_eq!(err, NodeError::permanent("provider error [aws]: AccessDenied"));
        assert!(!err.is_retryable());

        let err: NodeError = keystone_common::Error::validation("bad subnet").into();
        assert!(!err.is_retryable());
        assert!(!NodeError::MissingInput("name".into()).is_retryable());
    }

    #[test]
    fn malformed_graph_error_maps_to_node_error() {
        let err: NodeError = GraphError::MalformedEntry {
            index: 2,
            reason: "missing field repoURL".into(),
        }
        .into();
        assert!(matches!(err, NodeError::MalformedEntry { index: 2, .. }));
    }
}
