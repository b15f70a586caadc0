//! Bootstrap job emitter
//!
//! Emits the one-shot job that installs custom resource definitions into a
//! fresh cluster, together with the RBAC it runs under. The job body is an
//! ordered chain of `kubectl apply --server-side` calls, so re-running it is
//! create-or-update only. Consumers that need the CRDs depend on the job's
//! [`JobSucceeded`] barrier with a readiness edge; an explicit edge would only
//! wait for the Job object to exist.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Namespace, PodSpec, PodTemplateSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keystone_common::Error;
use keystone_graph::{ReadinessBarrier, ResourceKind, ResourceNode};
use serde_json::Value;

use crate::cluster::ClusterHandle;
use crate::config::StackConfig;
use crate::operations::ApplyManifestOperation;
use crate::probes::JobSucceeded;

/// Container name inside the bootstrap job
const CONTAINER_NAME: &str = "kubectl";

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        "keystone".to_string(),
    )])
}

/// Shell command applying every manifest in order, stopping at the first failure
pub fn bootstrap_command(urls: &[String]) -> String {
    urls.iter()
        .map(|url| format!("kubectl apply --server-side --force-conflicts -f {}", url))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// The stack namespace
pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// ClusterRole granting CRD management
pub fn cluster_role(config: &StackConfig) -> ClusterRole {
    let rbac = &config.rbac;
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(rbac.role_name.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(rbac.api_groups.clone()),
            resources: Some(rbac.resources.clone()),
            verbs: rbac.verbs.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Binds the CRD ClusterRole to the service account the job runs as
pub fn cluster_role_binding(config: &StackConfig) -> ClusterRoleBinding {
    let rbac = &config.rbac;
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(rbac.binding_name.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: rbac.role_name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: rbac.service_account.clone(),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// The CRD bootstrap Job
pub fn bootstrap_job(config: &StackConfig) -> Job {
    let bootstrap = &config.bootstrap;
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(bootstrap.image.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            bootstrap_command(&bootstrap.manifest_urls()),
        ]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(bootstrap.job_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(bootstrap.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(managed_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    service_account_name: Some(config.rbac.service_account.clone()),
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn to_manifest<T: serde::Serialize>(kind: &str, object: &T) -> Result<Value, Error> {
    serde_json::to_value(object).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Nodes emitted for the bootstrap job
#[derive(Debug)]
pub struct BootstrapNodes {
    /// CRD ClusterRole
    pub role: ResourceNode,
    /// Binding to the job's service account
    pub binding: ResourceNode,
    /// The job itself, gated on success
    pub job: ResourceNode,
}

impl BootstrapNodes {
    /// All three nodes, role first
    pub fn into_nodes(self) -> Vec<ResourceNode> {
        vec![self.role, self.binding, self.job]
    }
}

/// Emit the bootstrap job and its RBAC.
///
/// The role waits for `api_client`; the job waits for its binding and for
/// `namespace_node`. Node ids are the object names from the configuration.
pub fn emit(
    config: &StackConfig,
    cluster: &ClusterHandle,
    api_client: &str,
    namespace_node: &str,
) -> Result<BootstrapNodes, Error> {
    let apply = Arc::new(ApplyManifestOperation::new(cluster.clone()));
    let rbac = &config.rbac;
    let job_name = &config.bootstrap.job_name;

    let role = ResourceNode::new(&rbac.role_name, ResourceKind::RbacRule, apply.clone())
        .with_literal("manifest", to_manifest("ClusterRole", &cluster_role(config))?)
        .depends_on(api_client);

    let binding = ResourceNode::new(&rbac.binding_name, ResourceKind::RbacBinding, apply.clone())
        .with_literal(
            "manifest",
            to_manifest("ClusterRoleBinding", &cluster_role_binding(config))?,
        )
        .depends_on(&rbac.role_name)
        .depends_on(namespace_node);

    let probe = JobSucceeded::new(cluster.clone(), &config.namespace, job_name);
    let job = ResourceNode::new(job_name, ResourceKind::Job, apply)
        .with_literal("manifest", to_manifest("Job", &bootstrap_job(config))?)
        .depends_on(&rbac.binding_name)
        .depends_on(namespace_node)
        .with_barrier(ReadinessBarrier::polling(probe, config.bootstrap_policy()));

    Ok(BootstrapNodes { role, binding, job })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use keystone_graph::{
        operation_fn, DependencyGraph, EdgeKind, Executor, NodeError, NodeState, Outputs,
    };
    use serde_json::json;

    #[test]
    fn command_chains_server_side_applies() {
        let urls = vec!["https://x/a.yaml".to_string(), "https://x/b.yaml".to_string()];
        assert_eq!(
            bootstrap_command(&urls),
            "kubectl apply --server-side --force-conflicts -f https://x/a.yaml && \
             kubectl apply --server-side --force-conflicts -f https://x/b.yaml"
        );
        assert_eq!(bootstrap_command(&[]), "");
    }

    #[test]
    fn job_runs_every_crd_manifest_in_order() {
        let config = StackConfig::default();
        let job = bootstrap_job(&config);
        assert_eq!(job.metadata.name.as_deref(), Some("cluster-init-job"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("cicd"));

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(6));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("bitnami/kubectl:latest"));
        let command = container.command.as_ref().unwrap();
        assert_eq!(command[..2], ["/bin/sh".to_string(), "-c".to_string()]);
        assert_eq!(command[2].matches("kubectl apply --server-side").count(), 10);
        let first = command[2].find("alertmanagerconfigs").unwrap();
        let last = command[2].find("thanosrulers").unwrap();
        assert!(first < last);
    }

    #[test]
    fn binding_targets_namespace_service_account() {
        let binding = cluster_role_binding(&StackConfig::default());
        assert_eq!(binding.role_ref.name, "crd-patch-clusterrole");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "default");
        assert_eq!(subject.namespace.as_deref(), Some("cicd"));

        let role = cluster_role(&StackConfig::default());
        let rule = &role.rules.unwrap()[0];
        assert!(rule.verbs.contains(&"patch".to_string()));
        assert_eq!(rule.api_groups.as_deref(), Some(&["apiextensions.k8s.io".to_string()][..]));
    }

    #[test]
    fn manifests_carry_type_meta() {
        let job = to_manifest("Job", &bootstrap_job(&StackConfig::default())).unwrap();
        assert_eq!(job["apiVersion"], "batch/v1");
        assert_eq!(job["kind"], "Job");
        let role = to_manifest("ClusterRole", &cluster_role(&StackConfig::default())).unwrap();
        assert_eq!(role["apiVersion"], "rbac.authorization.k8s.io/v1");
    }

    #[test]
    fn emitted_nodes_are_wired_in_order() {
        let config = StackConfig::default();
        let nodes = emit(&config, &ClusterHandle::new(), "k8s-provider", "cicd-namespace").unwrap();

        assert_eq!(nodes.role.kind(), ResourceKind::RbacRule);
        assert!(nodes.role.declared_edges().contains_key("k8s-provider"));
        assert_eq!(
            nodes.binding.declared_edges().get("crd-patch-clusterrole"),
            Some(&EdgeKind::Explicit)
        );
        let job_edges = nodes.job.declared_edges();
        assert!(job_edges.contains_key("crd-patch-clusterrole-binding"));
        assert!(job_edges.contains_key("cicd-namespace"));
        assert_eq!(nodes.job.id(), "cluster-init-job");
        assert!(nodes.job.barrier().unwrap().describe().contains("cicd/cluster-init-job"));
    }

    async fn run_bootstrap(fake: &FakeCluster) -> keystone_graph::CompletedGraph {
        let config = StackConfig::default();
        let handle = ClusterHandle::new();
        let publish = handle.clone();
        let api = fake.clone();

        let mut graph = DependencyGraph::new();
        graph
            .add_node(ResourceNode::new(
                "k8s-provider",
                ResourceKind::ApiClient,
                operation_fn(move |_| {
                    publish.set(Arc::new(api.clone()));
                    async { Ok::<_, NodeError>(Outputs::new()) }
                }),
            ))
            .unwrap();
        graph
            .add_node(
                ResourceNode::new(
                    "cicd-namespace",
                    ResourceKind::Namespace,
                    Arc::new(ApplyManifestOperation::new(handle.clone())),
                )
                .with_literal("manifest", json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "cicd"}}))
                .depends_on("k8s-provider"),
            )
            .unwrap();
        for node in emit(&config, &handle, "k8s-provider", "cicd-namespace")
            .unwrap()
            .into_nodes()
        {
            graph.add_node(node).unwrap();
        }
        Executor::new().run(graph).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reapplying_bootstrap_converges_to_same_state() {
        let fake = FakeCluster::new();

        let first = run_bootstrap(&fake).await;
        assert_eq!(first.state("cluster-init-job"), Some(NodeState::Ready));
        let after_once = fake.objects();
        assert_eq!(after_once.len(), 4);

        run_bootstrap(&fake).await;
        assert_eq!(fake.objects(), after_once);
        assert_eq!(fake.apply_count(), 8);

        let job = fake.get("Job", "cluster-init-job").unwrap();
        assert_eq!(job["spec"]["template"]["spec"]["restartPolicy"], "OnFailure");
    }
}
