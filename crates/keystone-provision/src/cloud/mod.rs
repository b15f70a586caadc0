//! Cloud provider collaborator
//!
//! Every call is create-or-read: if the resource already exists it is
//! returned as-is (and converged where the provider allows it), so repeated
//! runs against the same stack are safe.

mod aws;

pub use aws::AwsCli;

use std::collections::BTreeMap;

use async_trait::async_trait;
use keystone_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

/// IAM role to ensure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Role name
    pub name: String,
    /// Service principal allowed to assume the role (e.g. "ec2.amazonaws.com")
    pub trust_service: String,
    /// Managed policy names, relative to `arn:aws:iam::aws:policy/`
    pub managed_policies: Vec<String>,
}

/// An existing IAM role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    /// Role name
    pub name: String,
    /// Role ARN
    pub arn: String,
}

/// An existing instance profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProfileInfo {
    /// Profile name
    pub name: String,
    /// Profile ARN
    pub arn: String,
}

/// Managed control plane to ensure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name
    pub name: String,
    /// ARN of the control plane role
    pub role_arn: String,
    /// Kubernetes version
    pub version: Option<String>,
    /// Subnets to place the control plane in
    pub subnet_ids: Vec<String>,
    /// Control plane log types to enable
    pub log_types: Vec<String>,
}

/// An active control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name
    pub name: String,
    /// Cluster ARN
    pub arn: String,
    /// API server endpoint
    pub endpoint: String,
    /// Base64 CA bundle for the API server
    pub certificate_authority: String,
    /// Subnets the cluster runs in
    pub subnet_ids: Vec<String>,
    /// Kubeconfig for reaching the API server
    pub kubeconfig: String,
}

/// Worker node pool to ensure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolSpec {
    /// Owning cluster
    pub cluster_name: String,
    /// Node group name
    pub name: String,
    /// ARN of the worker role
    pub node_role_arn: String,
    /// Subnets for the nodes
    pub subnet_ids: Vec<String>,
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
    /// Node labels
    pub labels: BTreeMap<String, String>,
}

/// An active node pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolInfo {
    /// Node group name
    pub name: String,
    /// Node group ARN
    pub arn: String,
}

/// Managed add-on to ensure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonSpec {
    /// Owning cluster
    pub cluster_name: String,
    /// Add-on name
    pub name: String,
    /// Add-on version
    pub version: String,
    /// Conflict resolution strategy
    pub resolve_conflicts: String,
}

/// An active add-on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonInfo {
    /// Add-on name
    pub name: String,
    /// Installed version
    pub version: String,
    /// Add-on ARN
    pub arn: String,
}

/// Trait abstracting the cloud control plane
///
/// Implemented by [`AwsCli`] in production and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Ensure an IAM role exists with the given trust and policies
    async fn ensure_role(&self, spec: &RoleSpec) -> Result<RoleInfo, Error>;

    /// Ensure an instance profile exists and contains `role_name`
    async fn ensure_instance_profile(
        &self,
        name: &str,
        role_name: &str,
    ) -> Result<InstanceProfileInfo, Error>;

    /// Ensure a control plane exists and is active
    async fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterInfo, Error>;

    /// Ensure a node pool exists and is active
    async fn ensure_node_pool(&self, spec: &NodePoolSpec) -> Result<NodePoolInfo, Error>;

    /// Ensure an add-on is installed at the requested version
    async fn ensure_addon(&self, spec: &AddonSpec) -> Result<AddonInfo, Error>;
}

/// Trust policy letting `service` assume a role
pub fn assume_role_policy(service: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": service},
            "Action": "sts:AssumeRole",
        }],
    })
}

/// Kubeconfig authenticating through `aws eks get-token`
pub fn render_kubeconfig(
    cluster_name: &str,
    endpoint: &str,
    certificate_authority: &str,
    region: Option<&str>,
) -> Result<String, Error> {
    let mut args = vec!["eks", "get-token", "--cluster-name", cluster_name];
    if let Some(region) = region {
        args.extend(["--region", region]);
    }

    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_name,
            "cluster": {
                "server": endpoint,
                "certificate-authority-data": certificate_authority,
            },
        }],
        "contexts": [{
            "name": cluster_name,
            "context": {"cluster": cluster_name, "user": cluster_name},
        }],
        "current-context": cluster_name,
        "users": [{
            "name": cluster_name,
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": "aws",
                    "args": args,
                    "interactiveMode": "Never",
                },
            },
        }],
    });
    Ok(serde_yaml::to_string(&kubeconfig)?)
}
