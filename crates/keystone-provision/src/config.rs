//! Stack configuration
//!
//! Every field has a default, so an empty file describes the reference stack:
//! an EKS cluster with a fixed ARM node group, the EBS CSI and VPC CNI add-ons,
//! a `cicd` namespace, a CRD bootstrap job and an Argo CD release.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use keystone_common::kube_utils::is_dns_label;
use keystone_common::{Error, RetryConfig};
use keystone_graph::BarrierPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level stack description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackConfig {
    /// Stack name; suffixes the cluster name and prefixes IAM names
    pub stack_name: String,
    /// Cloud region; falls back to the provider's own configuration when unset
    pub region: Option<String>,
    /// IAM roles
    pub iam: IamConfig,
    /// Control plane
    pub cluster: ClusterConfig,
    /// Worker node pool
    pub node_pool: NodePoolConfig,
    /// Managed add-ons, installed after the node pool
    pub addons: Vec<AddonConfig>,
    /// Namespace holding the bootstrap job and the GitOps controller
    pub namespace: String,
    /// RBAC granting the bootstrap job CRD access
    pub rbac: RbacConfig,
    /// CRD bootstrap job
    pub bootstrap: BootstrapConfig,
    /// GitOps controller release and application records
    pub gitops: GitOpsConfig,
    /// Interval between readiness probes, in seconds
    pub poll_interval_secs: u64,
    /// Attempts per creation operation (1 = no retry)
    pub creation_attempts: u32,
    /// Directory for the generated kubeconfig; the system temp dir when unset
    pub kubeconfig_dir: Option<PathBuf>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_name: "dev".to_string(),
            region: None,
            iam: IamConfig::default(),
            cluster: ClusterConfig::default(),
            node_pool: NodePoolConfig::default(),
            addons: vec![
                AddonConfig::new("aws-ebs-csi-driver", "v1.31.0-eksbuild.1"),
                AddonConfig::new("vpc-cni", "v1.18.2-eksbuild.1"),
            ],
            namespace: "cicd".to_string(),
            rbac: RbacConfig::default(),
            bootstrap: BootstrapConfig::default(),
            gitops: GitOpsConfig::default(),
            poll_interval_secs: 5,
            creation_attempts: 1,
            kubeconfig_dir: None,
        }
    }
}

/// IAM roles for the control plane and the worker nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IamConfig {
    /// Managed policies attached to the control plane role
    pub cluster_policies: Vec<String>,
    /// Managed policies attached to the worker instance role
    pub node_policies: Vec<String>,
}

impl Default for IamConfig {
    fn default() -> Self {
        Self {
            cluster_policies: vec!["AmazonEKSClusterPolicy".to_string()],
            node_policies: vec![
                "AmazonEKSWorkerNodePolicy".to_string(),
                "AmazonEKS_CNI_Policy".to_string(),
                "AmazonEC2ContainerRegistryReadOnly".to_string(),
                "service-role/AmazonEBSCSIDriverPolicy".to_string(),
            ],
        }
    }
}

/// Managed control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Cluster name is `{namePrefix}-{stackName}`
    pub name_prefix: String,
    /// Kubernetes version; the provider default when unset
    pub version: Option<String>,
    /// Subnets for the control plane and node pool
    pub subnet_ids: Vec<String>,
    /// Control plane log types to enable
    pub log_types: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name_prefix: "eks-cluster".to_string(),
            version: None,
            subnet_ids: Vec::new(),
            log_types: vec![
                "api".to_string(),
                "audit".to_string(),
                "authenticator".to_string(),
            ],
        }
    }
}

/// Worker node pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePoolConfig {
    /// Node group name
    pub name: String,
    /// Instance type
    pub instance_type: String,
    /// AMI family
    pub ami_type: String,
    /// Desired node count
    pub desired_size: u32,
    /// Minimum node count
    pub min_size: u32,
    /// Maximum node count
    pub max_size: u32,
    /// Kubernetes labels applied to every node
    pub labels: BTreeMap<String, String>,
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            name: "fixed-node-group".to_string(),
            instance_type: "t4g.small".to_string(),
            ami_type: "AL2_ARM_64".to_string(),
            desired_size: 5,
            min_size: 5,
            max_size: 7,
            labels: BTreeMap::from([("ondemand".to_string(), "true".to_string())]),
        }
    }
}

/// Managed cluster add-on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonConfig {
    /// Add-on name
    pub name: String,
    /// Add-on version
    pub version: String,
    /// Conflict resolution when the add-on's fields were changed out of band
    #[serde(default = "default_resolve_conflicts")]
    pub resolve_conflicts: String,
}

fn default_resolve_conflicts() -> String {
    "OVERWRITE".to_string()
}

impl AddonConfig {
    /// Add-on with OVERWRITE conflict resolution
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            resolve_conflicts: default_resolve_conflicts(),
        }
    }
}

/// Cluster role letting the bootstrap job manage CRDs, and its binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RbacConfig {
    /// ClusterRole name
    pub role_name: String,
    /// ClusterRoleBinding name
    pub binding_name: String,
    /// Service account (in the stack namespace) the role is bound to
    pub service_account: String,
    /// API groups the rule covers
    pub api_groups: Vec<String>,
    /// Resources the rule covers
    pub resources: Vec<String>,
    /// Verbs granted
    pub verbs: Vec<String>,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            role_name: "crd-patch-clusterrole".to_string(),
            binding_name: "crd-patch-clusterrole-binding".to_string(),
            service_account: "default".to_string(),
            api_groups: vec!["apiextensions.k8s.io".to_string()],
            resources: vec!["customresourcedefinitions".to_string()],
            verbs: ["get", "list", "watch", "patch", "update", "create"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

/// One-shot job installing CRDs from remote manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapConfig {
    /// Job name
    pub job_name: String,
    /// Container image providing kubectl
    pub image: String,
    /// Base URL the manifest names are appended to
    pub manifest_base_url: String,
    /// Manifest file names, applied in order
    pub manifests: Vec<String>,
    /// Pod failures tolerated before the job is failed
    pub backoff_limit: i32,
    /// Maximum wait for the job to succeed, in seconds
    pub max_wait_secs: u64,
}

const PROMETHEUS_OPERATOR_CRDS: &[&str] = &[
    "alertmanagerconfigs",
    "alertmanagers",
    "podmonitors",
    "probes",
    "prometheusagents",
    "prometheuses",
    "prometheusrules",
    "scrapeconfigs",
    "servicemonitors",
    "thanosrulers",
];

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            job_name: "cluster-init-job".to_string(),
            image: "bitnami/kubectl:latest".to_string(),
            manifest_base_url: "https://raw.githubusercontent.com/prometheus-operator/prometheus-operator/v0.75.0/example/prometheus-operator-crd/".to_string(),
            manifests: PROMETHEUS_OPERATOR_CRDS
                .iter()
                .map(|crd| format!("monitoring.coreos.com_{}.yaml", crd))
                .collect(),
            backoff_limit: 6,
            max_wait_secs: 600,
        }
    }
}

impl BootstrapConfig {
    /// Full URL of every manifest, in order
    pub fn manifest_urls(&self) -> Vec<String> {
        self.manifests
            .iter()
            .map(|m| format!("{}{}", self.manifest_base_url, m))
            .collect()
    }
}

/// How application records wait for the GitOps controller release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GitOpsGate {
    /// Start once the release exists
    Existence,
    /// Start a fixed settle delay after the release exists
    Settle,
    /// Start once every workload of the release is available
    Ready,
}

/// GitOps controller chart and the application records it reconciles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitOpsConfig {
    /// Helm release name
    pub release_name: String,
    /// Chart name
    pub chart: String,
    /// Chart repository URL
    pub repository: String,
    /// Chart version
    pub version: String,
    /// `--set` values
    pub values: BTreeMap<String, String>,
    /// Gate between the release and application records
    pub gate: GitOpsGate,
    /// Delay used by the settle gate, in seconds
    pub settle_secs: u64,
    /// Whether application records also wait for the CRD bootstrap job
    pub require_crds: bool,
    /// Maximum wait for the ready gate, in seconds
    pub max_wait_secs: u64,
    /// Node id prefix for application records
    pub app_id_prefix: String,
    /// Project every application record belongs to
    pub project: String,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            release_name: "argo-cd".to_string(),
            chart: "argo-cd".to_string(),
            repository: "https://argoproj.github.io/argo-helm".to_string(),
            version: "7.3.3".to_string(),
            values: BTreeMap::new(),
            gate: GitOpsGate::Settle,
            settle_secs: 10,
            require_crds: true,
            max_wait_secs: 600,
            app_id_prefix: "app-".to_string(),
            project: "default".to_string(),
        }
    }
}

impl StackConfig {
    /// Parse a stack file
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Control plane name
    pub fn cluster_name(&self) -> String {
        format!("{}-{}", self.cluster.name_prefix, self.stack_name)
    }

    /// Control plane IAM role name
    pub fn cluster_role_name(&self) -> String {
        format!("{}-cluster-role", self.stack_name)
    }

    /// Worker IAM role name
    pub fn instance_role_name(&self) -> String {
        format!("{}-instance-role", self.stack_name)
    }

    /// Worker instance profile name
    pub fn instance_profile_name(&self) -> String {
        format!("{}-instance-profile", self.stack_name)
    }

    /// Where the api-client node writes the kubeconfig
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.kubeconfig_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("{}.kubeconfig", self.cluster_name()))
    }

    /// Retry budget for creation operations
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.creation_attempts)
    }

    /// Barrier policy for the bootstrap job
    pub fn bootstrap_policy(&self) -> BarrierPolicy {
        BarrierPolicy {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: Duration::from_secs(self.bootstrap.max_wait_secs),
        }
    }

    /// Barrier policy for the GitOps release ready gate
    pub fn gitops_policy(&self) -> BarrierPolicy {
        BarrierPolicy {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: Duration::from_secs(self.gitops.max_wait_secs),
        }
    }

    /// Check the configuration for values no provider would accept
    pub fn validate(&self) -> Result<(), Error> {
        if !is_dns_label(&self.stack_name) {
            return Err(Error::validation_for_field(
                "stackName",
                format!("'{}' is not a valid DNS label", self.stack_name),
            ));
        }
        if !is_dns_label(&self.namespace) {
            return Err(Error::validation_for_field(
                "namespace",
                format!("'{}' is not a valid DNS label", self.namespace),
            ));
        }

        let pool = &self.node_pool;
        if pool.max_size == 0 {
            return Err(Error::validation_for_field(
                "nodePool.maxSize",
                "must be at least 1",
            ));
        }
        if pool.min_size > pool.desired_size || pool.desired_size > pool.max_size {
            return Err(Error::validation_for_field(
                "nodePool",
                format!(
                    "sizes must satisfy min <= desired <= max (got {} / {} / {})",
                    pool.min_size, pool.desired_size, pool.max_size
                ),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for addon in &self.addons {
            if !seen.insert(addon.name.as_str()) {
                return Err(Error::validation_for_field(
                    "addons",
                    format!("add-on '{}' is listed twice", addon.name),
                ));
            }
        }

        if self.bootstrap.manifests.is_empty() {
            return Err(Error::validation_for_field(
                "bootstrap.manifests",
                "at least one manifest is required",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::validation_for_field(
                "pollIntervalSecs",
                "must be at least 1",
            ));
        }
        if self.creation_attempts == 0 {
            return Err(Error::validation_for_field(
                "creationAttempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Application descriptor file: a list under the `applications` key
#[derive(Debug, Clone, Default, Deserialize)]
struct ApplicationsFile {
    #[serde(default)]
    applications: Vec<Value>,
}

/// Parse the application descriptor file into raw fan-out entries.
///
/// Entries are kept untyped so that one malformed entry is rejected on its
/// own instead of failing the whole file.
pub fn parse_applications(yaml: &str) -> Result<Vec<Value>, Error> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: ApplicationsFile = serde_yaml::from_str(yaml)?;
    Ok(file.applications)
}
