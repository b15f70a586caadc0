//! Cluster bring-up stack
//!
//! Wires the collaborators that talk to the outside world into a
//! [`keystone_graph::DependencyGraph`]:
//!
//! - `cloud` - IAM, control plane, node pools and add-ons ([`AwsCli`])
//! - `cluster` - the Kubernetes API once the control plane answers
//! - `release` - Helm chart releases ([`HelmCli`])
//! - `probes` - readiness probes for jobs and releases
//! - `bootstrap` - the CRD bootstrap job and its RBAC
//! - `gitops` - the GitOps controller and its application records
//! - `operations` - creation operations for every node kind
//! - `config` - the stack file and the application list
//! - `stack` - [`build_stack`], the bring-up order

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gitops;
pub mod operations;
pub mod probes;
pub mod release;
pub mod stack;

#[cfg(test)]
mod testing;

pub use cloud::{AwsCli, CloudProvider};
pub use cluster::{ClusterApi, ClusterConnector, ClusterHandle, KubeConnector};
pub use config::{parse_applications, GitOpsGate, StackConfig};
pub use error::StackError;
pub use release::{ChartRelease, HelmCli, ReleaseManager};
pub use stack::{build_stack, Collaborators, Stack};
