//! Dependency-ordered provisioning engine
//!
//! Infrastructure is described as a graph of [`ResourceNode`]s. Edges carry a
//! kind ([`EdgeKind`]) that decides whether a consumer waits for its producer
//! to be created or to be ready. The [`Executor`] walks the graph, running
//! independent branches concurrently, awaiting [`ReadinessBarrier`]s without
//! blocking, and failing fast per branch.
//!
//! # Modules
//!
//! - `node` - resource nodes, lifecycle states, inputs and creation operations
//! - `graph` - the dependency graph and edge kinds
//! - `sequence` - topological ready sets
//! - `barrier` - readiness predicates and barriers
//! - `executor` - the provisioning run
//! - `fanout` - one node per configuration entry
//! - `error` - graph, node and execution errors

#![deny(missing_docs)]

pub mod barrier;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod graph;
pub mod node;
pub mod sequence;

pub use barrier::{BarrierPolicy, FixedDelay, ReadinessBarrier, ReadinessPredicate, ReadinessProbe};
pub use error::{ExecutionError, FailedRun, GraphError, NodeError, NodeFailure};
pub use executor::{CompletedGraph, Executor, Transition};
pub use fanout::{FanOut, FanOutTemplate};
pub use graph::{DependencyGraph, EdgeKind};
pub use node::{
    operation_fn, CreateOperation, InputValue, NodeState, NodeView, OutputRef, Outputs,
    ResourceKind, ResourceNode,
};
pub use sequence::{ProvisionGroup, ProvisionSequence};
