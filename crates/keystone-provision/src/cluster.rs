//! Cluster API collaborator
//!
//! [`ClusterApi`] is everything the stack needs from the Kubernetes API
//! server once the control plane is up. A [`ClusterConnector`] produces one
//! from the kubeconfig published by the cluster node, and the api-client node
//! stores it in a [`ClusterHandle`] shared by every cluster-side node.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use keystone_common::kube_utils::{
    self, create_client_from_kubeconfig, is_deployment_available, is_job_complete, is_job_failed,
    is_statefulset_ready, poll_until,
};
use keystone_common::Error;
use keystone_graph::NodeError;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// How long to wait for a fresh control plane to answer
const CONNECT_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// An object as stored by the API server after an apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedObject {
    /// apiVersion
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace
    pub namespace: Option<String>,
    /// metadata.uid
    pub uid: Option<String>,
}

/// Observed progress of a Job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobProgress {
    /// Pods currently running
    pub active: i32,
    /// Pods that succeeded
    pub succeeded: i32,
    /// Pods that failed
    pub failed: i32,
    /// The Job reports completion
    pub complete: bool,
    /// The Job reports permanent failure (backoff limit exceeded)
    pub failed_permanently: bool,
}

/// Trait abstracting the Kubernetes API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server version string; doubles as a connectivity check
    async fn server_version(&self) -> Result<String, Error>;

    /// Server-side apply a manifest
    async fn apply(&self, manifest: &serde_json::Value) -> Result<AppliedObject, Error>;

    /// Progress of a Job, or `None` if it does not exist
    async fn job_progress(&self, namespace: &str, name: &str)
        -> Result<Option<JobProgress>, Error>;

    /// Whether every Deployment and StatefulSet matching `selector` is
    /// available. False when nothing matches.
    async fn workloads_available(&self, namespace: &str, selector: &str) -> Result<bool, Error>;
}

/// Produces a [`ClusterApi`] from kubeconfig YAML
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect and verify the API server answers
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterApi>, Error>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn server_version(&self) -> Result<String, Error> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn apply(&self, manifest: &serde_json::Value) -> Result<AppliedObject, Error> {
        let identity = kube_utils::ManifestIdentity::from_manifest(manifest)?;
        let applied = kube_utils::apply_manifest(&self.client, manifest).await?;
        Ok(AppliedObject {
            api_version: identity.api_version,
            kind: identity.kind,
            name: applied.name_any(),
            namespace: applied.namespace(),
            uid: applied.uid(),
        })
    }

    async fn job_progress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<JobProgress>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let Some(job) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let status = job.status.clone().unwrap_or_default();
        Ok(Some(JobProgress {
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            complete: is_job_complete(&job),
            failed_permanently: is_job_failed(&job),
        }))
    }

    async fn workloads_available(&self, namespace: &str, selector: &str) -> Result<bool, Error> {
        let params = ListParams::default().labels(selector);
        let deployments = Api::<Deployment>::namespaced(self.client.clone(), namespace)
            .list(&params)
            .await?;
        let statefulsets = Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
            .list(&params)
            .await?;

        let total = deployments.items.len() + statefulsets.items.len();
        let pending: Vec<String> = deployments
            .items
            .iter()
            .filter(|d| !is_deployment_available(d))
            .map(|d| d.name_any())
            .chain(
                statefulsets
                    .items
                    .iter()
                    .filter(|s| !is_statefulset_ready(s))
                    .map(|s| s.name_any()),
            )
            .collect();
        debug!(selector, total, pending = ?pending, "checked workload availability");
        Ok(total > 0 && pending.is_empty())
    }
}

/// Connects with kube-rs and waits for the API server to answer
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterApi>, Error> {
        let client = create_client_from_kubeconfig(kubeconfig).await?;
        let api = KubeClusterApi::new(client);

        let probe = &api;
        poll_until(
            CONNECT_TIMEOUT,
            CONNECT_POLL_INTERVAL,
            "API server did not become reachable",
            || async move { probe.server_version().await.map(|_| true) },
        )
        .await?;
        let version = api.server_version().await?;
        info!(version = %version, "connected to cluster API server");
        Ok(Arc::new(api))
    }
}

/// Write-once slot holding the cluster API client.
///
/// Set by the api-client node; read by every node downstream of it. The
/// graph guarantees readers run after the writer, so an empty slot at read
/// time means the graph is wired wrong.
#[derive(Clone, Default)]
pub struct ClusterHandle {
    inner: Arc<OnceCell<Arc<dyn ClusterApi>>>,
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClusterHandle {
    /// An empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the client. Returns false if one was already stored.
    pub fn set(&self, api: Arc<dyn ClusterApi>) -> bool {
        self.inner.set(api).is_ok()
    }

    /// The stored client
    pub fn get(&self) -> Result<Arc<dyn ClusterApi>, NodeError> {
        self.inner
            .get()
            .cloned()
            .ok_or_else(|| NodeError::permanent("cluster API client is not connected"))
    }

    /// Whether a client has been stored
    pub fn is_connected(&self) -> bool {
        self.inner.initialized()
    }
}
