//! End-to-end runs of small graphs through the public API

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keystone_graph::{
    operation_fn, BarrierPolicy, CreateOperation, DependencyGraph, EdgeKind, ExecutionError,
    Executor, FanOutTemplate, InputValue, NodeError, NodeState, NodeView, Outputs,
    ReadinessBarrier, ReadinessProbe, ResourceKind, ResourceNode,
};
use serde_json::json;

fn recording(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn CreateOperation> {
    operation_fn(move |view: NodeView| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(view.id.clone());
            Ok(Outputs::from([(
                "revision".to_string(),
                view.inputs.get("targetRevision").cloned().unwrap_or_default(),
            )]))
        }
    })
}

fn app(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "repoURL": format!("https://github.com/org/{}", name),
        "path": "deploy",
        "branch": "main",
    })
}

#[tokio::test(start_paused = true)]
async fn one_malformed_entry_among_five_leaves_four_ready() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut graph = DependencyGraph::new();
    graph
        .add_node(ResourceNode::new(
            "gitops",
            ResourceKind::ChartRelease,
            recording(log.clone()),
        ))
        .unwrap();

    let template = FanOutTemplate::new("app-", ResourceKind::ApplicationRecord, recording(log.clone()))
        .bind("name", "name")
        .bind("repoURL", "repoURL")
        .bind("path", "path")
        .bind("branch", "targetRevision")
        .with_dependency("gitops", EdgeKind::Explicit);

    let mut entries: Vec<_> = ["a", "b", "c", "d", "e"].iter().map(|n| app(n)).collect();
    entries[3].as_object_mut().unwrap().remove("path");

    let malformed = template.expand(&entries).add_to(&mut graph).unwrap();
    assert_eq!(malformed.len(), 1);

    let err = Executor::new().run(graph).await.unwrap_err();
    let run = match err {
        ExecutionError::Failed(run) => run,
        other => panic!("unexpected: {}", other),
    };
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].id, "app-d");
    assert!(matches!(
        run.failures[0].cause,
        NodeError::MalformedEntry { index: 3, .. }
    ));

    let ready = run.completed.ids_in(NodeState::Ready);
    assert_eq!(ready, vec!["app-a", "app-b", "app-c", "app-e", "gitops"]);
    assert!(!log.lock().unwrap().contains(&"app-d".to_string()));
    assert_eq!(
        run.completed.outputs("app-a").unwrap()["revision"],
        json!("main")
    );
}

#[tokio::test(start_paused = true)]
async fn empty_fan_out_runs_only_the_fixed_nodes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut graph = DependencyGraph::new();
    graph
        .add_node(ResourceNode::new(
            "gitops",
            ResourceKind::ChartRelease,
            recording(log.clone()),
        ))
        .unwrap();
    let template = FanOutTemplate::new("app-", ResourceKind::ApplicationRecord, recording(log.clone()))
        .with_dependency("gitops", EdgeKind::Readiness);

    assert!(template.expand(&[]).add_to(&mut graph).unwrap().is_empty());
    let done = Executor::new().run(graph).await.unwrap();
    assert_eq!(done.ids_in(NodeState::Ready), vec!["gitops"]);
}

struct JobProbe {
    succeed_after: Duration,
    started: tokio::time::Instant,
}

#[async_trait::async_trait]
impl ReadinessProbe for JobProbe {
    fn describe(&self) -> String {
        "job succeeded".into()
    }

    async fn probe(&self, _node: &NodeView) -> Result<bool, NodeError> {
        Ok(self.started.elapsed() >= self.succeed_after)
    }
}

#[tokio::test(start_paused = true)]
async fn readiness_consumer_waits_for_bootstrap_job() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let probe = JobProbe {
        succeed_after: Duration::from_secs(42),
        started: tokio::time::Instant::now(),
    };
    let policy = BarrierPolicy {
        poll_interval: Duration::from_secs(5),
        max_wait: Duration::from_secs(300),
    };

    let mut graph = DependencyGraph::new();
    graph
        .add_node(
            ResourceNode::new("cluster-init-job", ResourceKind::Job, recording(log.clone()))
                .with_barrier(ReadinessBarrier::polling(probe, policy)),
        )
        .unwrap();
    graph
        .add_node(
            ResourceNode::new("app-a", ResourceKind::ApplicationRecord, recording(log.clone()))
                .with_input("targetRevision", InputValue::literal("main"))
                .depends_on_ready("cluster-init-job"),
        )
        .unwrap();
    graph
        .add_node(
            ResourceNode::new("side", ResourceKind::Namespace, recording(log.clone()))
                .depends_on("cluster-init-job"),
        )
        .unwrap();
    graph
        .add_node(
            ResourceNode::new("reader", ResourceKind::Namespace, recording(log.clone()))
                .with_output_ref("targetRevision", "cluster-init-job", "revision"),
        )
        .unwrap();

    let start = tokio::time::Instant::now();
    let done = Executor::new().run(graph).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(45));

    let job_ready = done
        .transition_index("cluster-init-job", NodeState::Ready)
        .unwrap();
    assert!(done.transition_index("app-a", NodeState::Creating).unwrap() > job_ready);
    // existence is enough for an explicit edge, outputs are read only once Ready
    assert!(done.transition_index("side", NodeState::Creating).unwrap() < job_ready);
    assert!(done.transition_index("reader", NodeState::Creating).unwrap() > job_ready);
}
