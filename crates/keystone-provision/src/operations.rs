//! Creation operations for every node kind in the stack
//!
//! Each operation reads its parameters from the resolved [`NodeView`] inputs,
//! calls one collaborator, and publishes what downstream nodes consume as
//! outputs. None of them hold state of their own besides the collaborator.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use keystone_graph::{CreateOperation, NodeError, NodeView, Outputs};
use serde_json::{json, Value};
use tracing::info;

use crate::cloud::{AddonSpec, CloudProvider, ClusterSpec, NodePoolSpec, RoleSpec};
use crate::cluster::{ClusterConnector, ClusterHandle};
use crate::release::{ChartRelease, ReleaseManager};

fn outputs<const N: usize>(pairs: [(&str, Value); N]) -> Outputs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Optional string input; null and absent are both `None`
fn optional_str(view: &NodeView, name: &str) -> Option<String> {
    view.inputs
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// IAM role
///
/// Inputs: `name`, `trust_service`, `managed_policies`. Outputs: `name`, `arn`.
pub struct RoleOperation {
    cloud: Arc<dyn CloudProvider>,
}

impl RoleOperation {
    /// Operation backed by `cloud`
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CreateOperation for RoleOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let spec = RoleSpec {
            name: node.input_str("name")?.to_string(),
            trust_service: node.input_str("trust_service")?.to_string(),
            managed_policies: node.input_as("managed_policies")?,
        };
        let role = self.cloud.ensure_role(&spec).await?;
        Ok(outputs([("name", json!(role.name)), ("arn", json!(role.arn))]))
    }
}

/// Instance profile wrapping a role
///
/// Inputs: `name`, `role_name`. Outputs: `name`, `arn`.
pub struct InstanceProfileOperation {
    cloud: Arc<dyn CloudProvider>,
}

impl InstanceProfileOperation {
    /// Operation backed by `cloud`
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CreateOperation for InstanceProfileOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let profile = self
            .cloud
            .ensure_instance_profile(node.input_str("name")?, node.input_str("role_name")?)
            .await?;
        Ok(outputs([
            ("name", json!(profile.name)),
            ("arn", json!(profile.arn)),
        ]))
    }
}

/// Managed control plane
///
/// Inputs: `name`, `role_arn`, `version` (optional), `subnet_ids`,
/// `log_types`. Outputs: `name`, `arn`, `endpoint`, `certificate_authority`,
/// `subnet_ids`, `kubeconfig`.
pub struct ClusterOperation {
    cloud: Arc<dyn CloudProvider>,
}

impl ClusterOperation {
    /// Operation backed by `cloud`
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CreateOperation for ClusterOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let spec = ClusterSpec {
            name: node.input_str("name")?.to_string(),
            role_arn: node.input_str("role_arn")?.to_string(),
            version: optional_str(node, "version"),
            subnet_ids: node.input_as("subnet_ids")?,
            log_types: node.input_as("log_types")?,
        };
        let cluster = self.cloud.ensure_cluster(&spec).await?;
        info!(cluster = %cluster.name, endpoint = %cluster.endpoint, "control plane active");
        Ok(outputs([
            ("name", json!(cluster.name)),
            ("arn", json!(cluster.arn)),
            ("endpoint", json!(cluster.endpoint)),
            ("certificate_authority", json!(cluster.certificate_authority)),
            ("subnet_ids", json!(cluster.subnet_ids)),
            ("kubeconfig", json!(cluster.kubeconfig)),
        ]))
    }
}

/// Worker node pool
///
/// Inputs: `cluster_name`, `name`, `node_role_arn`, `subnet_ids`,
/// `instance_type`, `ami_type`, `desired_size`, `min_size`, `max_size`,
/// `labels`. Outputs: `name`, `arn`.
pub struct NodePoolOperation {
    cloud: Arc<dyn CloudProvider>,
}

impl NodePoolOperation {
    /// Operation backed by `cloud`
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CreateOperation for NodePoolOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let spec = NodePoolSpec {
            cluster_name: node.input_str("cluster_name")?.to_string(),
            name: node.input_str("name")?.to_string(),
            node_role_arn: node.input_str("node_role_arn")?.to_string(),
            subnet_ids: node.input_as("subnet_ids")?,
            instance_type: node.input_str("instance_type")?.to_string(),
            ami_type: node.input_str("ami_type")?.to_string(),
            desired_size: node.input_as("desired_size")?,
            min_size: node.input_as("min_size")?,
            max_size: node.input_as("max_size")?,
            labels: node.input_as("labels")?,
        };
        let pool = self.cloud.ensure_node_pool(&spec).await?;
        Ok(outputs([("name", json!(pool.name)), ("arn", json!(pool.arn))]))
    }
}

/// Managed cluster add-on
///
/// Inputs: `cluster_name`, `name`, `version`, `resolve_conflicts`.
/// Outputs: `name`, `version`, `arn`.
pub struct AddonOperation {
    cloud: Arc<dyn CloudProvider>,
}

impl AddonOperation {
    /// Operation backed by `cloud`
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CreateOperation for AddonOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let spec = AddonSpec {
            cluster_name: node.input_str("cluster_name")?.to_string(),
            name: node.input_str("name")?.to_string(),
            version: node.input_str("version")?.to_string(),
            resolve_conflicts: node.input_str("resolve_conflicts")?.to_string(),
        };
        let addon = self.cloud.ensure_addon(&spec).await?;
        Ok(outputs([
            ("name", json!(addon.name)),
            ("version", json!(addon.version)),
            ("arn", json!(addon.arn)),
        ]))
    }
}

/// Cluster API client.
///
/// Connects with the `kubeconfig` input, stores the client in the shared
/// [`ClusterHandle`] and writes the kubeconfig to disk for the release
/// manager. Outputs: `server_version`, `kubeconfig_path`.
pub struct ApiClientOperation {
    connector: Arc<dyn ClusterConnector>,
    cluster: ClusterHandle,
    kubeconfig_path: PathBuf,
}

impl ApiClientOperation {
    /// Operation publishing into `cluster` and writing to `kubeconfig_path`
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        cluster: ClusterHandle,
        kubeconfig_path: PathBuf,
    ) -> Self {
        Self {
            connector,
            cluster,
            kubeconfig_path,
        }
    }
}

#[async_trait]
impl CreateOperation for ApiClientOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let kubeconfig = node.input_str("kubeconfig")?;

        if let Some(dir) = self.kubeconfig_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| NodeError::creation_failed(format!("{}: {}", dir.display(), e)))?;
        }
        tokio::fs::write(&self.kubeconfig_path, kubeconfig)
            .await
            .map_err(|e| {
                NodeError::creation_failed(format!("{}: {}", self.kubeconfig_path.display(), e))
            })?;

        let api = match self.cluster.get() {
            Ok(api) => api,
            Err(_) => {
                let api = self.connector.connect(kubeconfig).await?;
                self.cluster.set(Arc::clone(&api));
                api
            }
        };
        let version = api.server_version().await?;
        Ok(outputs([
            ("server_version", json!(version)),
            (
                "kubeconfig_path",
                json!(self.kubeconfig_path.display().to_string()),
            ),
        ]))
    }
}

/// Server-side apply of the `manifest` input.
///
/// Outputs: `api_version`, `kind`, `name`, `namespace`, `uid`.
pub struct ApplyManifestOperation {
    cluster: ClusterHandle,
}

impl ApplyManifestOperation {
    /// Operation applying through `cluster`
    pub fn new(cluster: ClusterHandle) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl CreateOperation for ApplyManifestOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let manifest = node.input("manifest")?;
        let applied = self.cluster.get()?.apply(manifest).await?;
        info!(node = %node.id, kind = %applied.kind, name = %applied.name, "applied");
        Ok(outputs([
            ("api_version", json!(applied.api_version)),
            ("kind", json!(applied.kind)),
            ("name", json!(applied.name)),
            ("namespace", json!(applied.namespace)),
            ("uid", json!(applied.uid)),
        ]))
    }
}

/// Helm chart release
///
/// Inputs: `release` (a [`ChartRelease`]), `kubeconfig_path`.
/// Outputs: `name`, `namespace`, `revision`, `status`.
pub struct ChartReleaseOperation {
    releases: Arc<dyn ReleaseManager>,
}

impl ChartReleaseOperation {
    /// Operation backed by `releases`
    pub fn new(releases: Arc<dyn ReleaseManager>) -> Self {
        Self { releases }
    }
}

#[async_trait]
impl CreateOperation for ChartReleaseOperation {
    async fn create(&self, node: &NodeView) -> Result<Outputs, NodeError> {
        let release: ChartRelease = node.input_as("release")?;
        let kubeconfig = PathBuf::from(node.input_str("kubeconfig_path")?);
        let status = self
            .releases
            .install_or_upgrade(&release, &kubeconfig)
            .await?;
        info!(
            release = %status.name,
            revision = status.revision,
            status = %status.status,
            "chart release installed"
        );
        Ok(outputs([
            ("name", json!(status.name)),
            ("namespace", json!(status.namespace)),
            ("revision", json!(status.revision)),
            ("status", json!(status.status)),
        ]))
    }
}
