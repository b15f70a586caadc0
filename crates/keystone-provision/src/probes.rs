//! Readiness probes against the cluster API

use async_trait::async_trait;
use keystone_common::HELM_INSTANCE_LABEL;
use keystone_graph::{NodeError, NodeView, ReadinessProbe};
use tracing::{debug, warn};

use crate::cluster::ClusterHandle;

/// Ready once the Job has a succeeded pod.
///
/// A Job that exhausted its backoff limit can never succeed, so that fails
/// the barrier at once instead of waiting out the timeout.
#[derive(Debug, Clone)]
pub struct JobSucceeded {
    cluster: ClusterHandle,
    namespace: String,
    name: String,
}

impl JobSucceeded {
    /// Probe for the Job `namespace/name`
    pub fn new(cluster: ClusterHandle, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for JobSucceeded {
    fn describe(&self) -> String {
        format!("job {}/{} succeeded", self.namespace, self.name)
    }

    async fn probe(&self, node: &NodeView) -> Result<bool, NodeError> {
        let api = self.cluster.get()?;
        match api.job_progress(&self.namespace, &self.name).await {
            Ok(Some(progress)) if progress.failed_permanently => Err(NodeError::barrier_failed(
                format!(
                    "job {}/{} failed after {} attempt(s)",
                    self.namespace, self.name, progress.failed
                ),
            )),
            Ok(Some(progress)) => {
                debug!(
                    node = %node.id,
                    active = progress.active,
                    succeeded = progress.succeeded,
                    failed = progress.failed,
                    "job progress"
                );
                Ok(progress.complete || progress.succeeded >= 1)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(node = %node.id, error = %e, "job status check failed, will retry");
                Ok(false)
            }
        }
    }
}

/// Ready once every workload of a Helm release is available
#[derive(Debug, Clone)]
pub struct RolloutComplete {
    cluster: ClusterHandle,
    namespace: String,
    release: String,
}

impl RolloutComplete {
    /// Probe for the workloads of `release` in `namespace`
    pub fn new(
        cluster: ClusterHandle,
        namespace: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            release: release.into(),
        }
    }

    fn selector(&self) -> String {
        format!("{}={}", HELM_INSTANCE_LABEL, self.release)
    }
}

#[async_trait]
impl ReadinessProbe for RolloutComplete {
    fn describe(&self) -> String {
        format!("release {}/{} rolled out", self.namespace, self.release)
    }

    async fn probe(&self, node: &NodeView) -> Result<bool, NodeError> {
        let api = self.cluster.get()?;
        match api
            .workloads_available(&self.namespace, &self.selector())
            .await
        {
            Ok(available) => Ok(available),
            Err(e) => {
                warn!(node = %node.id, error = %e, "rollout check failed, will retry");
                Ok(false)
            }
        }
    }
}
