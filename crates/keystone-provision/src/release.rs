//! Chart release collaborator

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use keystone_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// A Helm chart release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRelease {
    /// Release name
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// Chart name
    pub chart: String,
    /// Chart repository URL
    pub repository: String,
    /// Chart version
    pub version: String,
    /// `--set` values
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// State of a release after install or upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    /// Release name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Release revision
    pub revision: u64,
    /// Helm status (deployed, failed, ...)
    pub status: String,
}

/// Installs chart releases into the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Install the release, or upgrade it in place if it exists
    async fn install_or_upgrade(
        &self,
        release: &ChartRelease,
        kubeconfig: &Path,
    ) -> Result<ReleaseStatus, Error>;
}

/// [`ReleaseManager`] driving the `helm` binary
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: String,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self {
            binary: "helm".to_string(),
        }
    }
}

impl HelmCli {
    /// Use the `helm` found on PATH
    pub fn new() -> Self {
        Self::default()
    }
}

/// Arguments for an idempotent `helm upgrade --install`
pub fn upgrade_install_args(release: &ChartRelease, kubeconfig: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "upgrade",
        "--install",
        &release.name,
        &release.chart,
        "--repo",
        &release.repository,
        "--version",
        &release.version,
        "--namespace",
        &release.namespace,
        "--create-namespace",
        "--output",
        "json",
    ]
    .iter()
    .map(|a| a.to_string())
    .collect();
    args.push("--kubeconfig".to_string());
    args.push(kubeconfig.display().to_string());
    for (key, value) in &release.values {
        args.push("--set".to_string());
        args.push(format!("{}={}", key, value));
    }
    args
}

/// Parse `helm ... --output json`
fn parse_release_status(release: &ChartRelease, stdout: &str) -> Result<ReleaseStatus, Error> {
    let value: Value = serde_json::from_str(stdout)?;
    Ok(ReleaseStatus {
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&release.name)
            .to_string(),
        namespace: value
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or(&release.namespace)
            .to_string(),
        revision: value.get("version").and_then(Value::as_u64).unwrap_or(0),
        status: value
            .pointer("/info/status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    })
}

#[async_trait]
impl ReleaseManager for HelmCli {
    async fn install_or_upgrade(
        &self,
        release: &ChartRelease,
        kubeconfig: &Path,
    ) -> Result<ReleaseStatus, Error> {
        info!(
            release = %release.name,
            chart = %release.chart,
            version = %release.version,
            namespace = %release.namespace,
            "installing chart release"
        );
        let args = upgrade_install_args(release, kubeconfig);
        debug!(command = %args.join(" "), "running helm");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::command_failed(&self.binary, e.to_string()))?;

        if !output.status.success() {
            return Err(Error::command_failed(
                &self.binary,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        let status = parse_release_status(release, &String::from_utf8_lossy(&output.stdout))?;
        if status.status == "failed" {
            return Err(Error::command_failed(
                &self.binary,
                format!("release {} is in failed state", status.name),
            ));
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn argo() -> ChartRelease {
        ChartRelease {
            name: "argo-cd".into(),
            namespace: "cicd".into(),
            chart: "argo-cd".into(),
            repository: "https://argoproj.github.io/argo-helm".into(),
            version: "7.3.3".into(),
            values: BTreeMap::from([("server.insecure".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn args_install_or_upgrade_at_pinned_version() {
        let args = upgrade_install_args(&argo(), &PathBuf::from("/tmp/eks.kubeconfig"));
        assert_eq!(&args[..4], ["upgrade", "--install", "argo-cd", "argo-cd"]);

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--version") + 1], "7.3.3");
        assert_eq!(args[pos("--namespace") + 1], "cicd");
        assert_eq!(args[pos("--kubeconfig") + 1], "/tmp/eks.kubeconfig");
        assert_eq!(args[pos("--set") + 1], "server.insecure=true");
        assert!(args.contains(&"--create-namespace".to_string()));
    }

    #[test]
    fn release_status_is_parsed() {
        let stdout = r#"{"name":"argo-cd","namespace":"cicd","version":3,"info":{"status":"deployed"}}"#;
        let status = parse_release_status(&argo(), stdout).unwrap();
        assert_eq!(
            status,
            ReleaseStatus {
                name: "argo-cd".into(),
                namespace: "cicd".into(),
                revision: 3,
                status: "deployed".into(),
            }
        );
    }

    #[test]
    fn sparse_status_falls_back_to_request() {
        let status = parse_release_status(&argo(), "{}").unwrap();
        assert_eq!(status.name, "argo-cd");
        assert_eq!(status.status, "unknown");
        assert!(parse_release_status(&argo(), "not json").is_err());
    }
}
