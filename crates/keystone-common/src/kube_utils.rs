//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction from an in-memory kubeconfig, server-side apply of
//! arbitrary manifests, and condition helpers used by readiness probes.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, trace};

use crate::{Error, FIELD_MANAGER};

/// Kubernetes condition status indicating the condition is met
const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll until a condition is met or timeout is reached.
///
/// Errors returned by `check_fn` are treated as transient and polling
/// continues; only the timeout produces an error.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from kubeconfig YAML held in memory
pub async fn create_client_from_kubeconfig(kubeconfig_yaml: &str) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig_yaml, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
        .await
}

/// Create a kube client from kubeconfig YAML with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig_yaml: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to parse kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Split an apiVersion into (group, version). Core resources have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Whether `value` is an RFC 1123 label: at most 63 lowercase alphanumerics
/// or '-', starting and ending with an alphanumeric
pub fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

/// Identity of a manifest extracted from its apiVersion/kind/metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIdentity {
    /// apiVersion, e.g. "batch/v1"
    pub api_version: String,
    /// Kind, e.g. "Job"
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, absent for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ManifestIdentity {
    /// Read the identity fields from a manifest
    pub fn from_manifest(manifest: &serde_json::Value) -> Result<Self, Error> {
        let field = |pointer: &str| {
            manifest
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let missing = |what: &str| {
            Error::serialization(format!("manifest is missing {}", what))
        };

        Ok(Self {
            api_version: field("/apiVersion").ok_or_else(|| missing("apiVersion"))?,
            kind: field("/kind").ok_or_else(|| missing("kind"))?,
            name: field("/metadata/name").ok_or_else(|| missing("metadata.name"))?,
            namespace: field("/metadata/namespace"),
        })
    }

    /// Group, version and kind to resolve through API discovery
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind {
            group,
            version,
            kind: self.kind.clone(),
        }
    }
}

/// Server-side apply a manifest and return the object as stored by the API server.
///
/// The resource type is resolved by discovery against the manifest's group and
/// version, so custom resources installed earlier in the run are found. The
/// object is namespaced when `metadata.namespace` is set and cluster-scoped
/// otherwise. Conflicts are forced so repeated runs converge.
pub async fn apply_manifest(
    client: &Client,
    manifest: &serde_json::Value,
) -> Result<DynamicObject, Error> {
    let identity = ManifestIdentity::from_manifest(manifest)?;
    let (api_resource, _) = kube::discovery::pinned_kind(client, &identity.gvk()).await?;
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let api: Api<DynamicObject> = match &identity.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &api_resource),
        None => Api::all_with(client.clone(), &api_resource),
    };

    debug!(
        kind = %identity.kind,
        name = %identity.name,
        namespace = ?identity.namespace,
        "applying manifest"
    );
    let applied = api
        .patch(&identity.name, &params, &Patch::Apply(manifest))
        .await?;
    Ok(applied)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::batch::v1::JobCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check whether a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// A Job has completed once it reports a Complete condition or a succeeded pod
pub fn is_job_complete(job: &Job) -> bool {
    job.status.as_ref().is_some_and(|s| {
        has_condition(s.conditions.as_deref(), "Complete") || s.succeeded.unwrap_or(0) > 0
    })
}

/// A Job has failed permanently once it reports a Failed condition
pub fn is_job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .is_some_and(|s| has_condition(s.conditions.as_deref(), "Failed"))
}

/// A Deployment is available when its Available condition is true
pub fn is_deployment_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .is_some_and(|s| has_condition(s.conditions.as_deref(), "Available"))
}

/// A StatefulSet is ready when every desired replica reports ready
pub fn is_statefulset_ready(statefulset: &StatefulSet) -> bool {
    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = statefulset
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DeploymentCondition, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use serde_json::json;

    fn job_condition(type_: &str, status: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_api_version_splits_group() {
        assert_eq!(
            parse_api_version("argoproj.io/v1alpha1"),
            ("argoproj.io".to_string(), "v1alpha1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn manifest_identity_reads_metadata() {
        let manifest = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "cluster-init-job", "namespace": "cicd"}
        });
        let identity = ManifestIdentity::from_manifest(&manifest).unwrap();
        assert_eq!(identity.kind, "Job");
        assert_eq!(identity.namespace.as_deref(), Some("cicd"));

        let cluster_scoped = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "crd-patch-clusterrole"}
        });
        let identity = ManifestIdentity::from_manifest(&cluster_scoped).unwrap();
        assert_eq!(identity.namespace, None);
    }

    #[test]
    fn gvk_splits_group_for_discovery() {
        let manifest = json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Application",
            "metadata": {"name": "web", "namespace": "cicd"}
        });
        let gvk = ManifestIdentity::from_manifest(&manifest).unwrap().gvk();
        assert_eq!(gvk.group, "argoproj.io");
        assert_eq!(gvk.version, "v1alpha1");
        assert_eq!(gvk.kind, "Application");

        let core = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "cicd"}});
        let gvk = ManifestIdentity::from_manifest(&core).unwrap().gvk();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("cicd"));
        assert!(is_dns_label("app-1"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("Web"));
        assert!(!is_dns_label("#1"));
        assert!(!is_dns_label("-web"));
        assert!(!is_dns_label("web.example"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }

    #[test]
    fn manifest_identity_rejects_missing_name() {
        let manifest = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {}});
        let err = ManifestIdentity::from_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn job_completion_and_failure() {
        let mut job = Job::default();
        assert!(!is_job_complete(&job));
        assert!(!is_job_failed(&job));

        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert!(is_job_complete(&job));

        job.status = Some(JobStatus {
            failed: Some(7),
            conditions: Some(vec![job_condition("Failed", "True")]),
            ..Default::default()
        });
        assert!(!is_job_complete(&job));
        assert!(is_job_failed(&job));

        job.status = Some(JobStatus {
            conditions: Some(vec![job_condition("Failed", "False")]),
            ..Default::default()
        });
        assert!(!is_job_failed(&job));
    }

    #[test]
    fn deployment_available_requires_true_condition() {
        let mut deployment = Deployment::default();
        assert!(!is_deployment_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_deployment_available(&deployment));
    }

    #[test]
    fn statefulset_ready_compares_replicas() {
        let mut sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!is_statefulset_ready(&sts));

        if let Some(status) = sts.status.as_mut() {
            status.ready_replicas = Some(2);
        }
        assert!(is_statefulset_ready(&sts));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out() {
        let result = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(1),
            "never ready",
            || async { Ok(false) },
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("never ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_tolerates_transient_errors() {
        let mut calls = 0;
        let result = poll_until(
            Duration::from_secs(30),
            Duration::from_secs(1),
            "unused",
            || {
                calls += 1;
                let n = calls;
                async move {
                    match n {
                        1 => Err(Error::internal("connection refused")),
                        2 => Ok(false),
                        _ => Ok(true),
                    }
                }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }
}
