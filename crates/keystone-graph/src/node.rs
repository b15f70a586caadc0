//! Resource nodes
//!
//! A node is one unit of desired infrastructure state: its kind, the inputs
//! its creation operation consumes, the dependencies it declares, and
//! optionally a readiness barrier. Lifecycle state and outputs are owned by
//! the executor; operations only ever see an immutable [`NodeView`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::barrier::ReadinessBarrier;
use crate::error::{GraphError, NodeError};
use crate::graph::EdgeKind;

/// Named outputs published by a node once it is created
pub type Outputs = BTreeMap<String, Value>;

/// The category of infrastructure a node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// IAM role
    Role,
    /// Instance profile wrapping a role
    InstanceProfile,
    /// Managed Kubernetes control plane
    Cluster,
    /// Worker node pool
    NodePool,
    /// Managed cluster add-on
    Addon,
    /// Connection to the cluster API server
    ApiClient,
    /// Kubernetes namespace
    Namespace,
    /// Cluster-wide RBAC rule set
    RbacRule,
    /// Binding of an RBAC rule set to a subject
    RbacBinding,
    /// One-shot Kubernetes Job
    Job,
    /// Helm chart release
    ChartRelease,
    /// GitOps application record
    ApplicationRecord,
}

impl ResourceKind {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Role => "role",
            ResourceKind::InstanceProfile => "instance-profile",
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "node-pool",
            ResourceKind::Addon => "addon",
            ResourceKind::ApiClient => "api-client",
            ResourceKind::Namespace => "namespace",
            ResourceKind::RbacRule => "rbac-rule",
            ResourceKind::RbacBinding => "rbac-binding",
            ResourceKind::Job => "job",
            ResourceKind::ChartRelease => "chart-release",
            ResourceKind::ApplicationRecord => "application-record",
        }
    }

    /// Whether nodes of this kind may carry a readiness barrier
    pub fn supports_barrier(&self) -> bool {
        matches!(self, ResourceKind::Job | ResourceKind::ChartRelease)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a node
///
/// ```text
/// Pending -> Creating -> AwaitingReadiness -> Ready
///                     \-------------------> Ready   (no barrier)
/// any non-terminal state -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    /// Waiting for dependencies
    Pending,
    /// Creation operation in flight
    Creating,
    /// Created; readiness barrier not yet satisfied
    AwaitingReadiness,
    /// Created and ready
    Ready,
    /// Creation, readiness or a dependency failed
    Failed,
}

impl NodeState {
    /// Ready and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Failed)
    }

    /// Whether the creation operation has succeeded
    pub fn is_created(&self) -> bool {
        matches!(self, NodeState::AwaitingReadiness | NodeState::Ready)
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Pending, Creating) => true,
            (Creating, AwaitingReadiness) | (Creating, Ready) => true,
            (AwaitingReadiness, Ready) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Creating => "creating",
            NodeState::AwaitingReadiness => "awaiting-readiness",
            NodeState::Ready => "ready",
            NodeState::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a named output of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Producer node id
    pub producer: String,
    /// Output name on the producer
    pub output: String,
}

/// A single input to a node's creation operation
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// Known at graph construction time
    Literal(Value),
    /// Resolved from a producer's outputs just before creation
    Ref(OutputRef),
}

impl InputValue {
    /// A literal input
    pub fn literal(value: impl Into<Value>) -> Self {
        InputValue::Literal(value.into())
    }

    /// A reference to `producer.output`
    pub fn output(producer: impl Into<String>, output: impl Into<String>) -> Self {
        InputValue::Ref(OutputRef {
            producer: producer.into(),
            output: output.into(),
        })
    }

    /// The producer this input depends on, if any
    pub fn producer(&self) -> Option<&str> {
        match self {
            InputValue::Literal(_) => None,
            InputValue::Ref(r) => Some(&r.producer),
        }
    }
}

/// Immutable snapshot handed to creation operations and readiness predicates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeView {
    /// Node id
    pub id: String,
    /// Resolved inputs
    pub inputs: BTreeMap<String, Value>,
    /// Outputs, populated once the node has been created
    pub outputs: Outputs,
}

impl NodeView {
    /// Look up a required input
    pub fn input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Look up a required string input
    pub fn input_str(&self, name: &str) -> Result<&str, NodeError> {
        self.input(name)?
            .as_str()
            .ok_or_else(|| NodeError::MissingInput(format!("{} (expected a string)", name)))
    }

    /// Deserialize a required input into a typed value
    pub fn input_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, NodeError> {
        serde_json::from_value(self.input(name)?.clone())
            .map_err(|e| NodeError::MissingInput(format!("{} ({})", name, e)))
    }

    /// Look up an output published at creation time
    pub fn output_str(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).and_then(Value::as_str)
    }
}

/// Creates (or adopts) the external resource a node describes.
///
/// Implementations must be idempotent: a resource that already exists in the
/// desired state is reported as success with its current outputs.
#[async_trait]
pub trait CreateOperation: Send + Sync {
    /// Perform the creation and return the node's outputs
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError>;
}

/// Adapter turning an async closure into a [`CreateOperation`]
pub struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> CreateOperation for FnOperation<F>
where
    F: Fn(NodeView) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outputs, NodeError>> + Send + 'static,
{
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        (self.0)(node.clone()).await
    }
}

/// Wrap an async closure as a creation operation
pub fn operation_fn<F, Fut>(f: F) -> Arc<dyn CreateOperation>
where
    F: Fn(NodeView) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outputs, NodeError>> + Send + 'static,
{
    Arc::new(FnOperation(f))
}

/// Stand-in operation for nodes that are rejected before the run starts
struct Rejected(NodeError);

#[async_trait]
impl CreateOperation for Rejected {
    async fn create(&self, _node: &NodeView) -> Result<Outputs, NodeError> {
        Err(self.0.clone())
    }
}

/// A unit of desired infrastructure state
pub struct ResourceNode {
    id: String,
    kind: ResourceKind,
    inputs: BTreeMap<String, InputValue>,
    dependencies: BTreeMap<String, EdgeKind>,
    barrier: Option<ReadinessBarrier>,
    operation: Arc<dyn CreateOperation>,
    state: NodeState,
    outputs: Option<Outputs>,
    failure: Option<NodeError>,
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("dependencies", &self.dependencies)
            .field("barrier", &self.barrier)
            .field("state", &self.state)
            .field("outputs", &self.outputs)
            .field("failure", &self.failure)
            .finish()
    }
}

impl ResourceNode {
    /// Create a Pending node
    pub fn new(
        id: impl Into<String>,
        kind: ResourceKind,
        operation: Arc<dyn CreateOperation>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            inputs: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            barrier: None,
            operation,
            state: NodeState::Pending,
            outputs: None,
            failure: None,
        }
    }

    /// Create a node that starts Failed and is never attempted
    pub fn rejected(id: impl Into<String>, kind: ResourceKind, cause: NodeError) -> Self {
        let mut node = Self::new(id, kind, Arc::new(Rejected(cause.clone())));
        node.state = NodeState::Failed;
        node.failure = Some(cause);
        node
    }

    /// Add an input
    pub fn with_input(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Add a literal input
    pub fn with_literal(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_input(name, InputValue::literal(value))
    }

    /// Add an input resolved from `producer.output`; implies a data edge
    pub fn with_output_ref(
        self,
        name: impl Into<String>,
        producer: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.with_input(name, InputValue::output(producer, output))
    }

    /// Declare an explicit dependency: wait until `id` is created
    pub fn depends_on(self, id: impl Into<String>) -> Self {
        self.with_dependency(id, EdgeKind::Explicit)
    }

    /// Declare a readiness dependency: wait until `id` is Ready
    pub fn depends_on_ready(self, id: impl Into<String>) -> Self {
        self.with_dependency(id, EdgeKind::Readiness)
    }

    /// Declare a dependency of the given kind
    pub fn with_dependency(mut self, id: impl Into<String>, kind: EdgeKind) -> Self {
        let entry = self.dependencies.entry(id.into()).or_insert(kind);
        *entry = (*entry).max(kind);
        self
    }

    /// Attach a readiness barrier
    pub fn with_barrier(mut self, barrier: ReadinessBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Node id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Node kind
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Declared inputs
    pub fn inputs(&self) -> &BTreeMap<String, InputValue> {
        &self.inputs
    }

    /// Readiness barrier, if any
    pub fn barrier(&self) -> Option<&ReadinessBarrier> {
        self.barrier.as_ref()
    }

    /// Outputs, present once the node has been created
    pub fn outputs(&self) -> Option<&Outputs> {
        self.outputs.as_ref()
    }

    /// Why the node failed, if it did
    pub fn failure(&self) -> Option<&NodeError> {
        self.failure.as_ref()
    }

    /// Every producer this node waits on: declared dependencies plus data
    /// edges implied by output references, merged to the strongest kind
    pub fn declared_edges(&self) -> BTreeMap<String, EdgeKind> {
        let mut edges = self.dependencies.clone();
        for producer in self.inputs.values().filter_map(InputValue::producer) {
            let entry = edges.entry(producer.to_string()).or_insert(EdgeKind::Data);
            *entry = (*entry).max(EdgeKind::Data);
        }
        edges
    }

    pub(crate) fn operation(&self) -> Arc<dyn CreateOperation> {
        Arc::clone(&self.operation)
    }

    fn transition(&mut self, next: NodeState) -> Result<(), GraphError> {
        if !self.state.can_transition_to(next) {
            return Err(GraphError::IllegalTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Pending -> Creating
    pub(crate) fn begin_creation(&mut self) -> Result<(), GraphError> {
        self.transition(NodeState::Creating)
    }

    /// Creating -> AwaitingReadiness (with barrier) or Ready (without).
    ///
    /// Outputs are published in the same step as the state change.
    pub(crate) fn complete_creation(&mut self, outputs: Outputs) -> Result<NodeState, GraphError> {
        let next = if self.barrier.is_some() {
            NodeState::AwaitingReadiness
        } else {
            NodeState::Ready
        };
        self.transition(next)?;
        self.outputs = Some(outputs);
        Ok(next)
    }

    /// AwaitingReadiness -> Ready
    pub(crate) fn mark_ready(&mut self) -> Result<(), GraphError> {
        self.transition(NodeState::Ready)
    }

    /// Any non-terminal state -> Failed
    pub(crate) fn mark_failed(&mut self, cause: NodeError) -> Result<(), GraphError> {
        self.transition(NodeState::Failed)?;
        self.failure = Some(cause);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn CreateOperation> {
        operation_fn(|_| async { Ok(Outputs::new()) })
    }

    #[test]
    fn lifecycle_without_barrier_goes_straight_to_ready() {
        let mut node = ResourceNode::new("ns", ResourceKind::Namespace, noop());
        assert_eq!(node.state(), NodeState::Pending);
        node.begin_creation().unwrap();
        let next = node
            .complete_creation(Outputs::from([("name".to_string(), json!("cicd"))]))
            .unwrap();
        assert_eq!(next, NodeState::Ready);
        assert_eq!(node.outputs().unwrap()["name"], json!("cicd"));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut node = ResourceNode::new("ns", ResourceKind::Namespace, noop());
        node.begin_creation().unwrap();
        node.complete_creation(Outputs::new()).unwrap();

        let err = node.begin_creation().unwrap_err();
        assert_eq!(
            err,
            GraphError::IllegalTransition {
                id: "ns".into(),
                from: NodeState::Ready,
                to: NodeState::Creating,
            }
        );
        assert!(node.mark_failed(NodeError::creation_failed("late")).is_err());
        assert_eq!(node.state(), NodeState::Ready);
    }

    #[test]
    fn pending_cannot_skip_to_ready() {
        assert!(!NodeState::Pending.can_transition_to(NodeState::Ready));
        assert!(!NodeState::Pending.can_transition_to(NodeState::AwaitingReadiness));
        assert!(NodeState::Pending.can_transition_to(NodeState::Failed));
        assert!(NodeState::AwaitingReadiness.can_transition_to(NodeState::Failed));
        assert!(!NodeState::Failed.can_transition_to(NodeState::Failed));
    }

    #[test]
    fn rejected_nodes_start_failed() {
        let cause = NodeError::MalformedEntry {
            index: 3,
            reason: "missing field path".into(),
        };
        let node = ResourceNode::rejected("app-#3", ResourceKind::ApplicationRecord, cause.clone());
        assert_eq!(node.state(), NodeState::Failed);
        assert_eq!(node.failure(), Some(&cause));
    }

    #[test]
    fn declared_edges_merge_data_refs_with_dependencies() {
        let node = ResourceNode::new("pool", ResourceKind::NodePool, noop())
            .with_output_ref("cluster_name", "cluster", "name")
            .with_output_ref("node_role_arn", "role", "arn")
            .depends_on("profile")
            .depends_on_ready("role");

        let edges = node.declared_edges();
        assert_eq!(edges["cluster"], EdgeKind::Data);
        assert_eq!(edges["profile"], EdgeKind::Explicit);
        assert_eq!(edges["role"], EdgeKind::Readiness);
    }

    #[test]
    fn view_inputs_are_typed() {
        let view = NodeView {
            id: "pool".into(),
            inputs: BTreeMap::from([
                ("instance_type".to_string(), json!("t4g.small")),
                ("min_size".to_string(), json!(5)),
            ]),
            outputs: Outputs::new(),
        };
        assert_eq!(view.input_str("instance_type").unwrap(), "t4g.small");
        assert_eq!(view.input_as::<u32>("min_size").unwrap(), 5);
        assert_eq!(
            view.input("max_size").unwrap_err(),
            NodeError::MissingInput("max_size".into())
        );
        assert!(view.input_str("min_size").is_err());
    }

    #[tokio::test]
    async fn fn_operation_receives_view() {
        let op = operation_fn(|view: NodeView| async move {
            Ok(Outputs::from([("echo".to_string(), json!(view.id))]))
        });
        let view = NodeView {
            id: "echo".into(),
            ..Default::default()
        };
        let outputs = op.create(&view).await.unwrap();
        assert_eq!(outputs["echo"], json!("echo"));
    }
}
