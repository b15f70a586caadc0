//! Provisioning executor
//!
//! The executor drives every node of a [`DependencyGraph`] through its
//! lifecycle. A single coordinator owns the graph and all state changes;
//! creation operations and readiness waits run as tasks on a `JoinSet` and
//! report back as events. That keeps transitions serialized (no node is ever
//! seen half-updated) while independent branches run concurrently.
//!
//! Failure handling is fail-fast per branch: a Failed node poisons its
//! transitive consumers, which are marked Failed without being attempted,
//! while unrelated branches continue to completion.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use keystone_common::retry::{retry_with_backoff, RetryConfig};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, FailedRun, NodeError, NodeFailure};
use crate::graph::DependencyGraph;
use crate::node::{NodeState, Outputs};
use crate::sequence::ProvisionSequence;

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Position in the run's global transition order
    pub seq: usize,
    /// Node id
    pub id: String,
    /// State entered
    pub state: NodeState,
}

/// Final state of a run: the graph with every node's state and outputs, and
/// the ordered transition trace
#[derive(Debug)]
pub struct CompletedGraph {
    graph: DependencyGraph,
    trace: Vec<Transition>,
}

impl CompletedGraph {
    /// The graph in its final state
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Every transition in the order it happened
    pub fn trace(&self) -> &[Transition] {
        &self.trace
    }

    /// Final state of a node
    pub fn state(&self, id: &str) -> Option<NodeState> {
        self.graph.get(id).map(|n| n.state())
    }

    /// Published outputs of a node
    pub fn outputs(&self, id: &str) -> Option<&Outputs> {
        self.graph.get(id).and_then(|n| n.outputs())
    }

    /// Why a node failed
    pub fn failure(&self, id: &str) -> Option<&NodeError> {
        self.graph.get(id).and_then(|n| n.failure())
    }

    /// Sequence number at which `id` entered `state`
    pub fn transition_index(&self, id: &str, state: NodeState) -> Option<usize> {
        self.trace
            .iter()
            .find(|t| t.id == id && t.state == state)
            .map(|t| t.seq)
    }

    /// Ids of every node currently in `state`, ascending
    pub fn ids_in(&self, state: NodeState) -> Vec<String> {
        self.graph
            .nodes()
            .filter(|n| n.state() == state)
            .map(|n| n.id().to_string())
            .collect()
    }
}

/// Result of a task spawned by the coordinator
enum TaskEvent {
    Created {
        id: String,
        result: Result<Outputs, NodeError>,
    },
    Settled {
        id: String,
        result: Result<(), NodeError>,
    },
}

/// Mutable state owned by the coordinator for one run
struct RunState {
    graph: DependencyGraph,
    trace: Vec<Transition>,
    ranks: BTreeMap<String, usize>,
}

impl RunState {
    fn record(&mut self, id: &str, state: NodeState) {
        let seq = self.trace.len();
        self.trace.push(Transition {
            seq,
            id: id.to_string(),
            state,
        });
        let kind = self.graph.get(id).map(|n| n.kind());
        match (state, self.graph.get(id).and_then(|n| n.failure())) {
            (NodeState::Failed, Some(cause)) if cause.is_dependency_failure() => {
                warn!(node = %id, kind = ?kind, seq, cause = %cause, "Node skipped")
            }
            (NodeState::Failed, Some(cause)) => {
                error!(node = %id, kind = ?kind, seq, cause = %cause, "Node failed")
            }
            _ => info!(node = %id, kind = ?kind, seq, state = %state, "Node transition"),
        }
    }

    fn fail(&mut self, id: &str, cause: NodeError) {
        let Some(node) = self.graph.get_mut(id) else {
            return;
        };
        match node.mark_failed(cause) {
            Ok(()) => self.record(id, NodeState::Failed),
            Err(e) => error!(node = %id, error = %e, "Ignoring failure for settled node"),
        }
    }

    /// Pending ids in topological rank order
    fn pending_by_rank(&self) -> Vec<String> {
        let mut pending: Vec<(usize, String)> = self
            .graph
            .nodes()
            .filter(|n| n.state() == NodeState::Pending)
            .map(|n| {
                let rank = self.ranks.get(n.id()).copied().unwrap_or(usize::MAX);
                (rank, n.id().to_string())
            })
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, id)| id).collect()
    }

    /// Mark every Pending node with a Failed producer as Failed.
    ///
    /// Rank order guarantees a whole failed chain is poisoned in one pass.
    fn poison_blocked(&mut self) {
        for id in self.pending_by_rank() {
            let dependency = self.graph.failed_producer(&id).map(str::to_string);
            if let Some(dependency) = dependency {
                self.fail(&id, NodeError::DependencyFailed { dependency });
            }
        }
    }

    /// Pending nodes whose incoming edges are all satisfied, ascending id
    fn dispatchable(&self) -> Vec<String> {
        self.graph
            .nodes()
            .filter(|n| n.state() == NodeState::Pending)
            .filter(|n| self.graph.dependencies_satisfied(n.id()))
            .map(|n| n.id().to_string())
            .collect()
    }
}

/// Runs a dependency graph to completion
#[derive(Debug, Clone, Default)]
pub struct Executor {
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Executor {
    /// Executor with a single attempt per creation and its own cancellation token
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry budget applied to every creation operation
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the run from starting further nodes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every node to a terminal state.
    ///
    /// Returns the completed graph when every node is Ready. Otherwise returns
    /// [`ExecutionError::Failed`] carrying root failures, poisoned nodes and,
    /// if cancelled, the nodes that were never started.
    pub async fn run(&self, graph: DependencyGraph) -> Result<CompletedGraph, ExecutionError> {
        let sequence = ProvisionSequence::from_graph(&graph)?;
        info!(
            nodes = sequence.total_nodes(),
            ready_sets = sequence.num_groups(),
            "Starting provisioning run"
        );

        let mut run = RunState {
            graph,
            trace: Vec::new(),
            ranks: sequence.ranks(),
        };
        for id in sequence.all_ids_in_order() {
            if run.graph.get(&id).map(|n| n.state()) == Some(NodeState::Failed) {
                run.record(&id, NodeState::Failed);
            }
        }

        let mut tasks: JoinSet<TaskEvent> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                warn!("Cancellation requested, no further nodes will be started");
            }

            loop {
                run.poison_blocked();
                let ready = if cancelled {
                    Vec::new()
                } else {
                    run.dispatchable()
                };
                if ready.is_empty() {
                    break;
                }
                for id in ready {
                    self.dispatch(&mut run, &id, &mut tasks);
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = self.cancel.cancelled(), if !cancelled => continue,
            };

            match joined {
                Some(Ok(event)) => self.handle(&mut run, event, &mut tasks),
                Some(Err(e)) => error!(error = %e, "Provisioning task did not complete"),
                None => break,
            }
        }

        for id in run.graph.ids() {
            let stuck = run
                .graph
                .get(&id)
                .is_some_and(|n| matches!(n.state(), NodeState::Creating | NodeState::AwaitingReadiness));
            if stuck {
                run.fail(&id, NodeError::Aborted("task ended without a result".into()));
            }
        }

        self.finish(run, cancelled)
    }

    fn dispatch(&self, run: &mut RunState, id: &str, tasks: &mut JoinSet<TaskEvent>) {
        let view = match run.graph.resolve_inputs(id) {
            Ok(view) => view,
            Err(cause) => {
                run.fail(id, cause);
                return;
            }
        };
        let Some(node) = run.graph.get_mut(id) else {
            return;
        };
        if let Err(e) = node.begin_creation() {
            error!(node = %id, error = %e, "Cannot start node");
            return;
        }
        let operation = node.operation();
        run.record(id, NodeState::Creating);

        let retry = self.retry.clone();
        let id = id.to_string();
        debug!(node = %id, inputs = view.inputs.len(), "Dispatching creation");
        tasks.spawn(async move {
            let attempt = retry_with_backoff(&retry, &view.id, NodeError::is_retryable, || {
                operation.create(&view)
            });
            let result = match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Aborted("creation operation panicked".into())),
            };
            TaskEvent::Created { id, result }
        });
    }

    fn handle(&self, run: &mut RunState, event: TaskEvent, tasks: &mut JoinSet<TaskEvent>) {
        match event {
            TaskEvent::Created { id, result: Err(cause) } => run.fail(&id, cause),
            TaskEvent::Created {
                id,
                result: Ok(outputs),
            } => {
                let Some(node) = run.graph.get_mut(&id) else {
                    return;
                };
                let next = match node.complete_creation(outputs) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(node = %id, error = %e, "Cannot record creation");
                        return;
                    }
                };
                let barrier = node.barrier().cloned();
                run.record(&id, next);

                if let (NodeState::AwaitingReadiness, Some(barrier)) = (next, barrier) {
                    let view = match run.graph.resolve_inputs(&id) {
                        Ok(view) => view,
                        Err(cause) => {
                            run.fail(&id, cause);
                            return;
                        }
                    };
                    debug!(node = %id, barrier = %barrier.describe(), "Awaiting readiness");
                    tasks.spawn(async move {
                        let result = match AssertUnwindSafe(barrier.wait(&view)).catch_unwind().await
                        {
                            Ok(result) => result,
                            Err(_) => Err(NodeError::Aborted("readiness predicate panicked".into())),
                        };
                        TaskEvent::Settled { id, result }
                    });
                }
            }
            TaskEvent::Settled { id, result: Ok(()) } => {
                if let Some(node) = run.graph.get_mut(&id) {
                    match node.mark_ready() {
                        Ok(()) => run.record(&id, NodeState::Ready),
                        Err(e) => error!(node = %id, error = %e, "Cannot mark node ready"),
                    }
                }
            }
            TaskEvent::Settled {
                id,
                result: Err(cause),
            } => run.fail(&id, cause),
        }
    }

    fn finish(&self, run: RunState, cancelled: bool) -> Result<CompletedGraph, ExecutionError> {
        let mut failures = Vec::new();
        let mut poisoned = Vec::new();
        let mut abandoned = Vec::new();

        for node in run.graph.nodes() {
            match node.state() {
                NodeState::Failed => {
                    let failure = NodeFailure {
                        id: node.id().to_string(),
                        kind: node.kind(),
                        cause: node
                            .failure()
                            .cloned()
                            .unwrap_or_else(|| NodeError::Aborted("unknown cause".into())),
                    };
                    if failure.cause.is_dependency_failure() {
                        poisoned.push(failure);
                    } else {
                        failures.push(failure);
                    }
                }
                NodeState::Pending => abandoned.push(node.id().to_string()),
                _ => {}
            }
        }

        let ready = run.graph.len() - failures.len() - poisoned.len() - abandoned.len();
        info!(
            ready,
            failed = failures.len(),
            skipped = poisoned.len(),
            abandoned = abandoned.len(),
            "Provisioning run finished"
        );

        let completed = CompletedGraph {
            graph: run.graph,
            trace: run.trace,
        };
        if failures.is_empty() && poisoned.is_empty() && abandoned.is_empty() {
            return Ok(completed);
        }
        Err(ExecutionError::Failed(Box::new(FailedRun {
            failures,
            poisoned,
            abandoned,
            cancelled,
            completed,
        })))
    }
}
