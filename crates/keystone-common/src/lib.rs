//! Common types and utilities shared across keystone crates
//!
//! - `error` - the collaborator error type
//! - `kube_utils` - client construction, server-side apply, condition helpers
//! - `retry` - exponential backoff with jitter

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;

pub use error::Error;
pub use retry::{retry_with_backoff, RetryConfig};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every server-side apply
pub const FIELD_MANAGER: &str = "keystone";

/// Address of the Kubernetes API server as seen from inside the cluster
pub const IN_CLUSTER_API_SERVER: &str = "https://kubernetes.default.svc";

/// Label selecting every workload that belongs to a Helm release
pub const HELM_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
