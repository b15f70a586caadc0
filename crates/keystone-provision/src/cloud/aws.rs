//! AWS implementation of [`CloudProvider`] driving the `aws` CLI
//!
//! The CLI is used instead of an SDK so the run uses exactly the credentials
//! and profile the operator's shell is configured with.

use std::process::Stdio;

use async_trait::async_trait;
use keystone_common::Error;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    assume_role_policy, render_kubeconfig, AddonInfo, AddonSpec, CloudProvider, ClusterInfo,
    ClusterSpec, InstanceProfileInfo, NodePoolInfo, NodePoolSpec, RoleInfo, RoleSpec,
};

const PROVIDER: &str = "aws";
const MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

/// Error codes meaning "the resource does not exist"
const NOT_FOUND_CODES: &[&str] = &["NoSuchEntity", "ResourceNotFoundException"];
/// Error codes that retrying will not fix
const PERMANENT_CODES: &[&str] = &[
    "AccessDenied",
    "UnauthorizedOperation",
    "InvalidParameterException",
    "ValidationError",
    "MalformedPolicyDocument",
];

/// Cloud provider backed by the `aws` command line
#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    region: Option<String>,
}

impl AwsCli {
    /// Use `region`, or the CLI's configured region when `None`
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--output".to_string(), "json".to_string()];
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        args
    }

    /// Run an aws command; stdout is parsed as JSON, empty output is `Null`
    async fn run(&self, args: &[String]) -> Result<Value, Error> {
        self.run_optional(args).await?.ok_or_else(|| {
            Error::provider_permanent(PROVIDER, format!("aws {}: resource not found", args.join(" ")))
        })
    }

    /// Like [`run`](Self::run) but a not-found error yields `None`
    async fn run_optional(&self, args: &[String]) -> Result<Option<Value>, Error> {
        debug!(command = %args.join(" "), "running aws");
        let output = Command::new("aws")
            .args(self.base_args())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::command_failed("aws", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if NOT_FOUND_CODES.iter().any(|code| stderr.contains(code)) {
                return Ok(None);
            }
            return Err(classify(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_str(&stdout)?))
    }

    async fn wait(&self, what: &str, args: Vec<String>) -> Result<(), Error> {
        info!(target_resource = %what, "waiting for resource to become active");
        let mut command = vec!["eks".to_string(), "wait".to_string()];
        command.extend(args);
        self.run(&command).await.map(|_| ())
    }
}

fn classify(stderr: String) -> Error {
    if PERMANENT_CODES.iter().any(|code| stderr.contains(code)) {
        Error::provider_permanent(PROVIDER, stderr)
    } else {
        Error::provider(PROVIDER, stderr)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Result<&'a str, Error> {
    value.pointer(pointer).and_then(Value::as_str).ok_or_else(|| {
        Error::serialization(format!("aws response is missing {}", pointer))
    })
}

fn strings_at(value: &Value, pointer: &str) -> Vec<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `k=v,k=v` as accepted by shorthand CLI arguments
fn shorthand(pairs: impl IntoIterator<Item = (String, String)>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl CloudProvider for AwsCli {
    async fn ensure_role(&self, spec: &RoleSpec) -> Result<RoleInfo, Error> {
        let existing = self
            .run_optional(&args(&["iam", "get-role", "--role-name", &spec.name]))
            .await?;
        let role = match existing {
            Some(role) => role,
            None => {
                info!(role = %spec.name, "creating IAM role");
                let trust = assume_role_policy(&spec.trust_service).to_string();
                self.run(&args(&[
                    "iam",
                    "create-role",
                    "--role-name",
                    &spec.name,
                    "--assume-role-policy-document",
                    &trust,
                ]))
                .await?
            }
        };

        for policy in &spec.managed_policies {
            let arn = format!("{}{}", MANAGED_POLICY_PREFIX, policy);
            self.run(&args(&[
                "iam",
                "attach-role-policy",
                "--role-name",
                &spec.name,
                "--policy-arn",
                &arn,
            ]))
            .await?;
        }

        Ok(RoleInfo {
            name: spec.name.clone(),
            arn: str_at(&role, "/Role/Arn")?.to_string(),
        })
    }

    async fn ensure_instance_profile(
        &self,
        name: &str,
        role_name: &str,
    ) -> Result<InstanceProfileInfo, Error> {
        let get = args(&["iam", "get-instance-profile", "--instance-profile-name", name]);
        let profile = match self.run_optional(&get).await? {
            Some(profile) => profile,
            None => {
                info!(profile = %name, "creating instance profile");
                self.run(&args(&[
                    "iam",
                    "create-instance-profile",
                    "--instance-profile-name",
                    name,
                ]))
                .await?
            }
        };

        let roles: Vec<String> = profile
            .pointer("/InstanceProfile/Roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|r| r.get("RoleName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !roles.iter().any(|r| r == role_name) {
            self.run(&args(&[
                "iam",
                "add-role-to-instance-profile",
                "--instance-profile-name",
                name,
                "--role-name",
                role_name,
            ]))
            .await?;
        }

        Ok(InstanceProfileInfo {
            name: name.to_string(),
            arn: str_at(&profile, "/InstanceProfile/Arn")?.to_string(),
        })
    }

    async fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterInfo, Error> {
        let describe = args(&["eks", "describe-cluster", "--name", &spec.name]);
        if self.run_optional(&describe).await?.is_none() {
            if spec.subnet_ids.len() < 2 {
                return Err(Error::validation_for_field(
                    "cluster.subnetIds",
                    "at least two subnets in different availability zones are required",
                ));
            }
            info!(cluster = %spec.name, "creating EKS cluster");
            let logging = serde_json::json!({
                "clusterLogging": [{"types": spec.log_types, "enabled": true}]
            })
            .to_string();
            let vpc = format!("subnetIds={}", spec.subnet_ids.join(","));
            let mut create = args(&[
                "eks",
                "create-cluster",
                "--name",
                &spec.name,
                "--role-arn",
                &spec.role_arn,
                "--resources-vpc-config",
                &vpc,
                "--logging",
                &logging,
            ]);
            if let Some(version) = &spec.version {
                create.extend(args(&["--kubernetes-version", version]));
            }
            self.run(&create).await?;
        }

        self.wait(&spec.name, args(&["cluster-active", "--name", &spec.name]))
            .await?;
        let cluster = self.run(&describe).await?;

        let endpoint = str_at(&cluster, "/cluster/endpoint")?;
        let certificate_authority = str_at(&cluster, "/cluster/certificateAuthority/data")?;
        Ok(ClusterInfo {
            name: spec.name.clone(),
            arn: str_at(&cluster, "/cluster/arn")?.to_string(),
            endpoint: endpoint.to_string(),
            certificate_authority: certificate_authority.to_string(),
            subnet_ids: strings_at(&cluster, "/cluster/resourcesVpcConfig/subnetIds"),
            kubeconfig: render_kubeconfig(
                &spec.name,
                endpoint,
                certificate_authority,
                self.region.as_deref(),
            )?,
        })
    }

    async fn ensure_node_pool(&self, spec: &NodePoolSpec) -> Result<NodePoolInfo, Error> {
        let describe = args(&[
            "eks",
            "describe-nodegroup",
            "--cluster-name",
            &spec.cluster_name,
            "--nodegroup-name",
            &spec.name,
        ]);
        if self.run_optional(&describe).await?.is_none() {
            info!(node_group = %spec.name, cluster = %spec.cluster_name, "creating node group");
            let scaling = shorthand([
                ("minSize".to_string(), spec.min_size.to_string()),
                ("maxSize".to_string(), spec.max_size.to_string()),
                ("desiredSize".to_string(), spec.desired_size.to_string()),
            ]);
            let mut create = args(&[
                "eks",
                "create-nodegroup",
                "--cluster-name",
                &spec.cluster_name,
                "--nodegroup-name",
                &spec.name,
                "--node-role",
                &spec.node_role_arn,
                "--instance-types",
                &spec.instance_type,
                "--ami-type",
                &spec.ami_type,
                "--scaling-config",
                &scaling,
                "--subnets",
            ]);
            create.extend(spec.subnet_ids.iter().cloned());
            if !spec.labels.is_empty() {
                create.push("--labels".to_string());
                create.push(shorthand(spec.labels.clone()));
            }
            self.run(&create).await?;
        }

        self.wait(
            &spec.name,
            args(&[
                "nodegroup-active",
                "--cluster-name",
                &spec.cluster_name,
                "--nodegroup-name",
                &spec.name,
            ]),
        )
        .await?;
        let group = self.run(&describe).await?;
        Ok(NodePoolInfo {
            name: spec.name.clone(),
            arn: str_at(&group, "/nodegroup/nodegroupArn")?.to_string(),
        })
    }

    async fn ensure_addon(&self, spec: &AddonSpec) -> Result<AddonInfo, Error> {
        let describe = args(&[
            "eks",
            "describe-addon",
            "--cluster-name",
            &spec.cluster_name,
            "--addon-name",
            &spec.name,
        ]);
        let change = match self.run_optional(&describe).await? {
            None => Some("create-addon"),
            Some(addon) if str_at(&addon, "/addon/addonVersion")? != spec.version => {
                Some("update-addon")
            }
            Some(_) => None,
        };
        if let Some(action) = change {
            info!(addon = %spec.name, version = %spec.version, action, "converging add-on");
            self.run(&args(&[
                "eks",
                action,
                "--cluster-name",
                &spec.cluster_name,
                "--addon-name",
                &spec.name,
                "--addon-version",
                &spec.version,
                "--resolve-conflicts",
                &spec.resolve_conflicts,
            ]))
            .await?;
        }

        self.wait(
            &spec.name,
            args(&[
                "addon-active",
                "--cluster-name",
                &spec.cluster_name,
                "--addon-name",
                &spec.name,
            ]),
        )
        .await?;
        let addon = self.run(&describe).await?;
        Ok(AddonInfo {
            name: spec.name.clone(),
            version: str_at(&addon, "/addon/addonVersion")?.to_string(),
            arn: str_at(&addon, "/addon/addonArn")?.to_string(),
        })
    }
}
