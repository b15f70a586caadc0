//! CLI commands

use std::path::{Path, PathBuf};

use clap::Args;
use keystone_graph::{DependencyGraph, ProvisionSequence};
use keystone_provision::{parse_applications, StackConfig};
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

pub mod plan;
pub mod up;
pub mod validate;

/// Application list read when `--apps` is not given
pub const DEFAULT_APPS_FILE: &str = "argo-cd-apps.yaml";

/// Where the stack comes from, shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct StackArgs {
    /// Stack file (YAML); built-in defaults when omitted
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Application list file
    #[arg(long)]
    pub apps: Option<PathBuf>,

    /// Stack name (overrides the stack file)
    #[arg(long, env = "KEYSTONE_STACK")]
    pub stack_name: Option<String>,

    /// Cloud region (overrides the stack file)
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Maximum wait for readiness barriers, in seconds
    #[arg(long)]
    pub max_wait_secs: Option<u64>,

    /// Retries per creation operation after the first attempt
    #[arg(long)]
    pub creation_retries: Option<u32>,
}

/// Configuration and application entries, ready for graph construction
#[derive(Debug, Clone)]
pub struct LoadedStack {
    /// Stack configuration with command-line overrides applied
    pub config: StackConfig,
    /// Raw application entries
    pub applications: Vec<Value>,
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::File {
        path: path.to_path_buf(),
        source,
    })
}

impl StackArgs {
    /// Read the stack file and application list and apply overrides
    pub fn load(&self) -> Result<LoadedStack> {
        let mut config = match &self.config {
            Some(path) => StackConfig::from_yaml(&read(path)?)?,
            None => StackConfig::default(),
        };

        if let Some(name) = &self.stack_name {
            config.stack_name = name.clone();
        }
        if let Some(region) = &self.region {
            config.region = Some(region.clone());
        }
        if let Some(secs) = self.max_wait_secs {
            config.bootstrap.max_wait_secs = secs;
            config.gitops.max_wait_secs = secs;
        }
        if let Some(retries) = self.creation_retries {
            config.creation_attempts = retries.saturating_add(1);
        }

        let applications = match &self.apps {
            Some(path) => parse_applications(&read(path)?)?,
            None => {
                let default = Path::new(DEFAULT_APPS_FILE);
                if default.exists() {
                    parse_applications(&read(default)?)?
                } else {
                    debug!(file = DEFAULT_APPS_FILE, "no application list, skipping applications");
                    Vec::new()
                }
            }
        };

        Ok(LoadedStack {
            config,
            applications,
        })
    }
}

/// Ready sets of `graph`, one per line group
pub fn render_plan(graph: &DependencyGraph) -> Result<String> {
    let sequence = ProvisionSequence::from_graph(graph)?;
    Ok(sequence.render(graph))
}
