//! GitOps controller release and the application records it reconciles
//!
//! The controller is a chart-release node. Application records are fanned out
//! from the application list, one node per entry. How records wait for the
//! controller is chosen by [`GitOpsGate`]:
//!
//! - `existence` - explicit edge; records start once the release is installed
//! - `settle` - the release carries a fixed-delay barrier, records use a
//!   readiness edge
//! - `ready` - the release carries a rollout barrier, records use a readiness
//!   edge
//!
//! Records also take a readiness edge on the CRD bootstrap job when
//! `require_crds` is set, since the Application kind must be installed first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keystone_common::IN_CLUSTER_API_SERVER;
use keystone_graph::{
    CreateOperation, EdgeKind, FanOutTemplate, InputValue, NodeError, NodeView, Outputs,
    ReadinessBarrier, ResourceKind, ResourceNode,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::cluster::ClusterHandle;
use crate::config::{GitOpsGate, StackConfig};
use crate::operations::ChartReleaseOperation;
use crate::probes::RolloutComplete;
use crate::release::{ChartRelease, ReleaseManager};

/// Application kind reconciled by the controller
pub const APPLICATION_API_VERSION: &str = "argoproj.io/v1alpha1";

/// One application the GitOps controller should reconcile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    /// Application name
    pub name: String,
    /// Namespace the Application object lives in
    pub namespace: String,
    /// Controller project
    pub project: String,
    /// Source repository
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    /// Path inside the repository
    pub path: String,
    /// Branch, tag or commit
    pub target_revision: String,
    /// Cluster the application is deployed to
    pub destination_server: String,
}

impl ApplicationRecord {
    /// Read a record from a generated node's inputs
    pub fn from_view(view: &NodeView) -> Result<Self, NodeError> {
        Ok(Self {
            name: view.input_str("name")?.to_string(),
            namespace: view.input_str("namespace")?.to_string(),
            project: view.input_str("project")?.to_string(),
            repo_url: view.input_str("repo_url")?.to_string(),
            path: view.input_str("path")?.to_string(),
            target_revision: view.input_str("target_revision")?.to_string(),
            destination_server: view.input_str("destination_server")?.to_string(),
        })
    }

    /// The Application object
    pub fn manifest(&self) -> Value {
        json!({
            "apiVersion": APPLICATION_API_VERSION,
            "kind": "Application",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": {
                "project": self.project,
                "source": {
                    "repoURL": self.repo_url,
                    "path": self.path,
                    "targetRevision": self.target_revision,
                },
                "destination": {
                    "server": self.destination_server,
                },
            },
        })
    }
}

/// Applies an [`ApplicationRecord`] built from the node's inputs
pub struct ApplicationRecordOperation {
    cluster: ClusterHandle,
}

impl ApplicationRecordOperation {
    /// Operation applying through `cluster`
    pub fn new(cluster: ClusterHandle) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl CreateOperation for ApplicationRecordOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let record = ApplicationRecord::from_view(node)?;
        let applied = self.cluster.get()?.apply(&record.manifest()).await?;
        info!(
            application = %record.name,
            revision = %record.target_revision,
            "application record applied"
        );
        Ok(Outputs::from([
            ("name".to_string(), json!(record.name)),
            ("namespace".to_string(), json!(record.namespace)),
            ("destinationServer".to_string(), json!(record.destination_server)),
            ("targetRevision".to_string(), json!(record.target_revision)),
            ("uid".to_string(), json!(applied.uid)),
        ]))
    }
}

/// Fan-out template for application records.
///
/// Entries need `name`, `repoURL`, `path` and `branch`; anything else in an
/// entry is ignored.
pub fn application_template(
    config: &StackConfig,
    cluster: &ClusterHandle,
    release_node: &str,
    bootstrap_job: &str,
) -> FanOutTemplate {
    let gitops = &config.gitops;
    let release_edge = match gitops.gate {
        GitOpsGate::Existence => EdgeKind::Explicit,
        GitOpsGate::Settle | GitOpsGate::Ready => EdgeKind::Readiness,
    };

    let mut template = FanOutTemplate::new(
        &gitops.app_id_prefix,
        ResourceKind::ApplicationRecord,
        Arc::new(ApplicationRecordOperation::new(cluster.clone())),
    )
    .bind("repoURL", "repo_url")
    .bind("path", "path")
    .bind("branch", "target_revision")
    .bind("name", "name")
    .with_input("namespace", InputValue::literal(config.namespace.clone()))
    .with_input("project", InputValue::literal(gitops.project.clone()))
    .with_input(
        "destination_server",
        InputValue::literal(IN_CLUSTER_API_SERVER),
    )
    .with_dependency(release_node, release_edge);

    if gitops.require_crds {
        template = template.with_dependency(bootstrap_job, EdgeKind::Readiness);
    }
    template
}

/// The controller's chart release
pub fn controller_release(config: &StackConfig) -> ChartRelease {
    let gitops = &config.gitops;
    ChartRelease {
        name: gitops.release_name.clone(),
        namespace: config.namespace.clone(),
        chart: gitops.chart.clone(),
        repository: gitops.repository.clone(),
        version: gitops.version.clone(),
        values: gitops.values.clone(),
    }
}

/// Barrier the release carries for the configured gate
pub fn release_barrier(config: &StackConfig, cluster: &ClusterHandle) -> Option<ReadinessBarrier> {
    let gitops = &config.gitops;
    match gitops.gate {
        GitOpsGate::Existence => None,
        GitOpsGate::Settle => Some(ReadinessBarrier::fixed_delay(Duration::from_secs(
            gitops.settle_secs,
        ))),
        GitOpsGate::Ready => Some(ReadinessBarrier::polling(
            RolloutComplete::new(cluster.clone(), &config.namespace, &gitops.release_name),
            config.gitops_policy(),
        )),
    }
}

/// Chart-release node for the controller.
///
/// Takes the kubeconfig path from `api_client` and waits for `namespace_node`.
pub fn controller_node(
    config: &StackConfig,
    releases: Arc<dyn ReleaseManager>,
    cluster: &ClusterHandle,
    api_client: &str,
    namespace_node: &str,
) -> Result<ResourceNode, keystone_common::Error> {
    let release = serde_json::to_value(controller_release(config))?;
    let mut node = ResourceNode::new(
        &config.gitops.release_name,
        ResourceKind::ChartRelease,
        Arc::new(ChartReleaseOperation::new(releases)),
    )
    .with_literal("release", release)
    .with_output_ref("kubeconfig_path", api_client, "kubeconfig_path")
    .depends_on(namespace_node);

    if let Some(barrier) = release_barrier(config, cluster) {
        node = node.with_barrier(barrier);
    }
    Ok(node)
}
