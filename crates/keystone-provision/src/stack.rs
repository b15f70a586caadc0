//! Stack graph construction
//!
//! [`build_stack`] is the one place the bring-up order lives:
//!
//! ```text
//! cluster-role ─┐
//! instance-role ┼─ eks-cluster ─ node pool ─ add-ons ─ k8s-provider ─┬─ namespace ─┬─ argo-cd ─┐
//!   └ instance-profile ┘                                             └─ rbac ──────┴─ job ─────┴─ app-*
//! ```
//!
//! Values the cloud hands back (ARNs, the cluster name, the kubeconfig) flow
//! along data edges; the rest are explicit or readiness edges.

use std::sync::Arc;

use keystone_graph::{DependencyGraph, GraphError, ResourceKind, ResourceNode};
use serde_json::Value;
use tracing::{info, warn};

use crate::bootstrap;
use crate::cloud::{AwsCli, CloudProvider};
use crate::cluster::{ClusterConnector, ClusterHandle, KubeConnector};
use crate::config::StackConfig;
use crate::error::StackError;
use crate::gitops;
use crate::operations::{
    AddonOperation, ApiClientOperation, ApplyManifestOperation, ClusterOperation,
    InstanceProfileOperation, NodePoolOperation, RoleOperation,
};
use crate::release::{HelmCli, ReleaseManager};

/// Control plane IAM role
pub const CLUSTER_ROLE: &str = "cluster-role";
/// Worker IAM role
pub const INSTANCE_ROLE: &str = "instance-role";
/// Worker instance profile
pub const INSTANCE_PROFILE: &str = "instance-profile";
/// Managed control plane
pub const CLUSTER: &str = "eks-cluster";
/// Cluster API client
pub const API_CLIENT: &str = "k8s-provider";

/// Node id of an add-on
pub fn addon_id(name: &str) -> String {
    format!("addon-{}", name)
}

/// Node id of the stack namespace
pub fn namespace_id(namespace: &str) -> String {
    format!("{}-namespace", namespace)
}

/// External systems the stack's nodes talk to
#[derive(Clone)]
pub struct Collaborators {
    /// Cloud control plane
    pub cloud: Arc<dyn CloudProvider>,
    /// Builds the cluster API client
    pub connector: Arc<dyn ClusterConnector>,
    /// Chart releases
    pub releases: Arc<dyn ReleaseManager>,
}

impl Collaborators {
    /// The `aws` CLI, kube-rs and the `helm` CLI
    pub fn production(region: Option<String>) -> Self {
        Self {
            cloud: Arc::new(AwsCli::new(region)),
            connector: Arc::new(KubeConnector),
            releases: Arc::new(HelmCli::new()),
        }
    }
}

/// A fully wired stack graph
#[derive(Debug)]
pub struct Stack {
    /// Every node of the stack, rejected application records included
    pub graph: DependencyGraph,
    /// Why each rejected application entry was rejected
    pub malformed: Vec<GraphError>,
    /// Cluster API client, filled in by the api-client node during the run
    pub cluster: ClusterHandle,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StackError> {
    serde_json::to_value(value).map_err(|e| StackError::Manifest(e.into()))
}

fn cloud_nodes(
    config: &StackConfig,
    cloud: &Arc<dyn CloudProvider>,
) -> Result<Vec<ResourceNode>, StackError> {
    let role = Arc::new(RoleOperation::new(cloud.clone()));
    let pool = &config.node_pool;

    let mut nodes = vec![
        ResourceNode::new(CLUSTER_ROLE, ResourceKind::Role, role.clone())
            .with_literal("name", config.cluster_role_name())
            .with_literal("trust_service", "eks.amazonaws.com")
            .with_literal("managed_policies", to_json(&config.iam.cluster_policies)?),
        ResourceNode::new(INSTANCE_ROLE, ResourceKind::Role, role)
            .with_literal("name", config.instance_role_name())
            .with_literal("trust_service", "ec2.amazonaws.com")
            .with_literal("managed_policies", to_json(&config.iam.node_policies)?),
        ResourceNode::new(
            INSTANCE_PROFILE,
            ResourceKind::InstanceProfile,
            Arc::new(InstanceProfileOperation::new(cloud.clone())),
        )
        .with_literal("name", config.instance_profile_name())
        .with_output_ref("role_name", INSTANCE_ROLE, "name"),
        ResourceNode::new(
            CLUSTER,
            ResourceKind::Cluster,
            Arc::new(ClusterOperation::new(cloud.clone())),
        )
        .with_literal("name", config.cluster_name())
        .with_output_ref("role_arn", CLUSTER_ROLE, "arn")
        .with_literal("version", to_json(&config.cluster.version)?)
        .with_literal("subnet_ids", to_json(&config.cluster.subnet_ids)?)
        .with_literal("log_types", to_json(&config.cluster.log_types)?)
        .depends_on(INSTANCE_ROLE),
        ResourceNode::new(
            &pool.name,
            ResourceKind::NodePool,
            Arc::new(NodePoolOperation::new(cloud.clone())),
        )
        .with_output_ref("cluster_name", CLUSTER, "name")
        .with_output_ref("subnet_ids", CLUSTER, "subnet_ids")
        .with_output_ref("node_role_arn", INSTANCE_ROLE, "arn")
        .with_literal("name", pool.name.clone())
        .with_literal("instance_type", pool.instance_type.clone())
        .with_literal("ami_type", pool.ami_type.clone())
        .with_literal("desired_size", pool.desired_size)
        .with_literal("min_size", pool.min_size)
        .with_literal("max_size", pool.max_size)
        .with_literal("labels", to_json(&pool.labels)?)
        .depends_on(INSTANCE_PROFILE),
    ];

    let addon_op = Arc::new(AddonOperation::new(cloud.clone()));
    for addon in &config.addons {
        nodes.push(
            ResourceNode::new(addon_id(&addon.name), ResourceKind::Addon, addon_op.clone())
                .with_output_ref("cluster_name", CLUSTER, "name")
                .with_literal("name", addon.name.clone())
                .with_literal("version", addon.version.clone())
                .with_literal("resolve_conflicts", addon.resolve_conflicts.clone())
                .depends_on(&pool.name),
        );
    }
    Ok(nodes)
}

/// Build the whole stack graph from configuration and the application list.
///
/// Malformed application entries do not fail the build; they become nodes
/// that start Failed and are listed in [`Stack::malformed`].
pub fn build_stack(
    config: &StackConfig,
    applications: &[Value],
    collaborators: &Collaborators,
) -> Result<Stack, StackError> {
    config.validate().map_err(StackError::Config)?;

    let cluster = ClusterHandle::new();
    let mut graph = DependencyGraph::new();

    for node in cloud_nodes(config, &collaborators.cloud)? {
        graph.add_node(node)?;
    }

    let mut api_client = ResourceNode::new(
        API_CLIENT,
        ResourceKind::ApiClient,
        Arc::new(ApiClientOperation::new(
            collaborators.connector.clone(),
            cluster.clone(),
            config.kubeconfig_path(),
        )),
    )
    .with_output_ref("kubeconfig", CLUSTER, "kubeconfig")
    .depends_on(&config.node_pool.name);
    for addon in &config.addons {
        api_client = api_client.depends_on(addon_id(&addon.name));
    }
    graph.add_node(api_client)?;

    let namespace_node = namespace_id(&config.namespace);
    let namespace_manifest = to_json(&bootstrap::namespace(&config.namespace))?;
    graph.add_node(
        ResourceNode::new(
            &namespace_node,
            ResourceKind::Namespace,
            Arc::new(ApplyManifestOperation::new(cluster.clone())),
        )
        .with_literal("manifest", namespace_manifest)
        .depends_on(API_CLIENT),
    )?;

    let bootstrap = bootstrap::emit(config, &cluster, API_CLIENT, &namespace_node)
        .map_err(StackError::Manifest)?;
    let job_id = bootstrap.job.id().to_string();
    for node in bootstrap.into_nodes() {
        graph.add_node(node)?;
    }

    let controller = gitops::controller_node(
        config,
        collaborators.releases.clone(),
        &cluster,
        API_CLIENT,
        &namespace_node,
    )
    .map_err(StackError::Manifest)?;
    let controller_id = controller.id().to_string();
    graph.add_node(controller)?;

    let malformed = gitops::application_template(config, &cluster, &controller_id, &job_id)
        .expand(applications)
        .add_to(&mut graph)?;
    for rejected in &malformed {
        warn!(error = %rejected, "application entry rejected");
    }

    graph.check_complete()?;
    info!(
        stack = %config.stack_name,
        cluster = %config.cluster_name(),
        nodes = graph.len(),
        applications = applications.len(),
        "stack graph built"
    );

    Ok(Stack {
        graph,
        malformed,
        cluster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{
        AddonInfo, ClusterInfo, InstanceProfileInfo, MockCloudProvider, NodePoolInfo, RoleInfo,
    };
    use crate::cluster::{ClusterApi, MockClusterConnector};
    use crate::config::GitOpsGate;
    use crate::release::{MockReleaseManager, ReleaseStatus};
    use crate::testing::FakeCluster;
    use keystone_graph::{EdgeKind, ExecutionError, Executor, NodeError, NodeState, ProvisionSequence};
    use serde_json::json;

    fn application_entry(name: &str, repo_url: &str, path: &str, branch: &str) -> Value {
        json!({"name": name, "repoURL": repo_url, "path": path, "branch": branch})
    }

    fn apps() -> Vec<Value> {
        vec![
            application_entry("monitoring", "https://github.com/org/monitoring", "k8s", "main"),
            application_entry("web", "https://github.com/org/web", "deploy", "release"),
        ]
    }

    fn inert() -> Collaborators {
        Collaborators {
            cloud: Arc::new(MockCloudProvider::new()),
            connector: Arc::new(MockClusterConnector::new()),
            releases: Arc::new(MockReleaseManager::new()),
        }
    }

    fn healthy_cloud() -> MockCloudProvider {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_ensure_role().times(2).returning(|spec| {
            Ok(RoleInfo {
                name: spec.name.clone(),
                arn: format!("arn:aws:iam::123:role/{}", spec.name),
            })
        });
        cloud
            .expect_ensure_instance_profile()
            .times(1)
            .returning(|name, _| {
                Ok(InstanceProfileInfo {
                    name: name.to_string(),
                    arn: format!("arn:aws:iam::123:instance-profile/{}", name),
                })
            });
        cloud.expect_ensure_cluster().times(1).returning(|spec| {
            Ok(ClusterInfo {
                name: spec.name.clone(),
                arn: format!("arn:aws:eks:us-west-2:123:cluster/{}", spec.name),
                endpoint: "https://ABC.eks.amazonaws.com".into(),
                certificate_authority: "Y2E=".into(),
                subnet_ids: vec!["subnet-a".into(), "subnet-b".into()],
                kubeconfig: "kind: Config\n".into(),
            })
        });
        cloud
            .expect_ensure_node_pool()
            .withf(|spec| {
                spec.cluster_name == "eks-cluster-dev"
                    && spec.node_role_arn == "arn:aws:iam::123:role/dev-instance-role"
                    && spec.subnet_ids == ["subnet-a", "subnet-b"]
            })
            .times(1)
            .returning(|spec| {
                Ok(NodePoolInfo {
                    name: spec.name.clone(),
                    arn: "arn:aws:eks:nodegroup".into(),
                })
            });
        cloud.expect_ensure_addon().times(2).returning(|spec| {
            Ok(AddonInfo {
                name: spec.name.clone(),
                version: spec.version.clone(),
                arn: format!("arn:aws:eks:addon/{}", spec.name),
            })
        });
        cloud
    }

    fn healthy_collaborators(fake: &FakeCluster) -> Collaborators {
        let mut connector = MockClusterConnector::new();
        let api = fake.clone();
        connector
            .expect_connect()
            .withf(|kubeconfig| kubeconfig == "kind: Config\n")
            .times(1)
            .returning(move |_| {
                let api: Arc<dyn ClusterApi> = Arc::new(api.clone());
                Ok(api)
            });

        let mut releases = MockReleaseManager::new();
        releases
            .expect_install_or_upgrade()
            .times(1)
            .returning(|release, _| {
                Ok(ReleaseStatus {
                    name: release.name.clone(),
                    namespace: release.namespace.clone(),
                    revision: 1,
                    status: "deployed".into(),
                })
            });

        Collaborators {
            cloud: Arc::new(healthy_cloud()),
            connector: Arc::new(connector),
            releases: Arc::new(releases),
        }
    }

    #[test]
    fn reference_stack_wires_every_node() {
        let stack = build_stack(&StackConfig::default(), &apps(), &inert()).unwrap();
        let graph = &stack.graph;
        assert_eq!(graph.len(), 15);
        assert!(stack.malformed.is_empty());
        assert!(!stack.cluster.is_connected());

        assert_eq!(graph.edge(CLUSTER_ROLE, CLUSTER), Some(EdgeKind::Data));
        assert_eq!(graph.edge(INSTANCE_ROLE, INSTANCE_PROFILE), Some(EdgeKind::Data));
        assert_eq!(graph.edge(CLUSTER, "fixed-node-group"), Some(EdgeKind::Data));
        assert_eq!(graph.edge(INSTANCE_PROFILE, "fixed-node-group"), Some(EdgeKind::Explicit));
        assert_eq!(graph.edge("fixed-node-group", "addon-vpc-cni"), Some(EdgeKind::Explicit));
        assert_eq!(graph.edge(CLUSTER, API_CLIENT), Some(EdgeKind::Data));
        assert_eq!(graph.edge("addon-aws-ebs-csi-driver", API_CLIENT), Some(EdgeKind::Explicit));
        assert_eq!(graph.edge(API_CLIENT, "argo-cd"), Some(EdgeKind::Data));
        assert_eq!(graph.edge("argo-cd", "app-web"), Some(EdgeKind::Readiness));
        assert_eq!(graph.edge("cluster-init-job", "app-web"), Some(EdgeKind::Readiness));
        assert!(graph.get("cluster-init-job").unwrap().barrier().is_some());
        assert!(graph.get("argo-cd").unwrap().barrier().is_some());
    }

    #[test]
    fn ready_sets_follow_bring_up_order() {
        let stack = build_stack(&StackConfig::default(), &apps(), &inert()).unwrap();
        let sequence = ProvisionSequence::from_graph(&stack.graph).unwrap();
        let group = |id: &str| sequence.group_of(id).unwrap();

        assert_eq!(sequence.groups()[0].ids, vec![CLUSTER_ROLE, INSTANCE_ROLE]);
        assert!(group(INSTANCE_PROFILE) < group("fixed-node-group"));
        assert!(group(CLUSTER) < group("fixed-node-group"));
        assert!(group("fixed-node-group") < group("addon-vpc-cni"));
        assert!(group("addon-vpc-cni") < group(API_CLIENT));
        assert!(group(API_CLIENT) < group("cicd-namespace"));
        assert!(group("crd-patch-clusterrole-binding") < group("cluster-init-job"));
        assert!(group("cluster-init-job") < group("app-monitoring"));
        assert_eq!(group("app-monitoring"), group("app-web"));
        assert_eq!(sequence.total_nodes(), 15);
    }

    #[test]
    fn existence_gate_uses_explicit_edge_without_barrier() {
        let mut config = StackConfig::default();
        config.gitops.gate = GitOpsGate::Existence;
        config.gitops.require_crds = false;
        let stack = build_stack(&config, &apps(), &inert()).unwrap();

        assert_eq!(stack.graph.edge("argo-cd", "app-web"), Some(EdgeKind::Explicit));
        assert_eq!(stack.graph.edge("cluster-init-job", "app-web"), None);
        assert!(stack.graph.get("argo-cd").unwrap().barrier().is_none());
    }

    #[test]
    fn malformed_application_is_kept_as_failed_node() {
        let mut entries = apps();
        entries.push(json!({"name": "broken", "repoURL": "https://x"}));
        let stack = build_stack(&StackConfig::default(), &entries, &inert()).unwrap();

        assert_eq!(stack.malformed.len(), 1);
        assert_eq!(
            stack.graph.get("app-broken").unwrap().state(),
            NodeState::Failed
        );
    }

    #[test]
    fn stack_without_addons_connects_after_node_pool() {
        let mut config = StackConfig::default();
        config.addons.clear();
        let stack = build_stack(&config, &[], &inert()).unwrap();
        assert_eq!(stack.graph.len(), 11);
        assert_eq!(
            stack.graph.edge("fixed-node-group", API_CLIENT),
            Some(EdgeKind::Explicit)
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_wiring() {
        let mut config = StackConfig::default();
        config.creation_attempts = 0;
        let err = build_stack(&config, &apps(), &inert()).unwrap_err();
        assert!(matches!(err, StackError::Config(_)));
        assert!(err.graph_error().is_none());
    }

    #[test]
    fn colliding_node_ids_are_rejected() {
        let mut config = StackConfig::default();
        config.node_pool.name = CLUSTER.to_string();
        let err = build_stack(&config, &apps(), &inert()).unwrap_err();
        assert_eq!(
            err.graph_error(),
            Some(&GraphError::DuplicateId(CLUSTER.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_brings_up_every_node() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig {
            kubeconfig_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let fake = FakeCluster::new();
        let stack = build_stack(&config, &apps(), &healthy_collaborators(&fake)).unwrap();

        let done = Executor::new().run(stack.graph).await.unwrap();
        assert_eq!(done.ids_in(NodeState::Ready).len(), 15);
        assert!(stack.cluster.is_connected());

        // the settle barrier holds applications back until it has elapsed
        let settled = done.transition_index("argo-cd", NodeState::Ready).unwrap();
        let started = done
            .transition_index("app-monitoring", NodeState::Creating)
            .unwrap();
        assert!(settled < started);

        let app = fake.get("Application", "web").unwrap();
        assert_eq!(app["spec"]["source"]["targetRevision"], "release");
        assert!(fake.get("Job", "cluster-init-job").is_some());
        assert!(config.kubeconfig_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_failure_spares_nothing_downstream() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_ensure_role().returning(|spec| {
            Ok(RoleInfo {
                name: spec.name.clone(),
                arn: "arn".into(),
            })
        });
        cloud.expect_ensure_instance_profile().returning(|name, _| {
            Ok(InstanceProfileInfo {
                name: name.to_string(),
                arn: "arn".into(),
            })
        });
        cloud
            .expect_ensure_cluster()
            .times(1)
            .returning(|_| Err(keystone_common::Error::provider_permanent("aws", "quota exceeded")));

        let collaborators = Collaborators {
            cloud: Arc::new(cloud),
            ..inert()
        };
        // a permanent error is not retried even with attempts to spare
        let config = StackConfig {
            creation_attempts: 3,
            ..Default::default()
        };
        let stack = build_stack(&config, &apps(), &collaborators).unwrap();
        let err = Executor::new()
            .with_retry(config.retry())
            .run(stack.graph)
            .await
            .unwrap_err();

        let ExecutionError::Failed(run) = err else {
            panic!("expected a failed run");
        };
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].id, CLUSTER);
        assert_eq!(run.poisoned.len(), 11);
        assert!(run
            .poisoned
            .iter()
            .all(|p| matches!(p.cause, NodeError::DependencyFailed { .. })));
        assert_eq!(run.completed.state(INSTANCE_PROFILE), Some(NodeState::Ready));
    }
}
