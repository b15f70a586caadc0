//! Plan command - print the provisioning order without touching anything

use clap::Args;
use keystone_provision::{build_stack, Collaborators};

use super::{render_plan, LoadedStack, StackArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub stack: StackArgs,
}

pub async fn run(args: PlanArgs) -> Result<()> {
    let loaded = args.stack.load()?;
    print!("{}", plan_text(&loaded)?);
    Ok(())
}

/// The ready sets, followed by any rejected application entries.
///
/// Collaborators are constructed but never called.
pub fn plan_text(loaded: &LoadedStack) -> Result<String> {
    let collaborators = Collaborators::production(loaded.config.region.clone());
    let stack = build_stack(&loaded.config, &loaded.applications, &collaborators)?;

    let mut out = format!(
        "Stack {} (cluster {}), {} nodes\n",
        loaded.config.stack_name,
        loaded.config.cluster_name(),
        stack.graph.len()
    );
    out.push_str(&render_plan(&stack.graph)?);
    for rejected in &stack.malformed {
        out.push_str(&format!("rejected: {}\n", rejected));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_provision::StackConfig;
    use serde_json::json;

    #[test]
    fn plan_lists_ready_sets_in_order() {
        let loaded = LoadedStack {
            config: StackConfig::default(),
            applications: vec![
                json!({"name": "web", "repoURL": "https://x/web", "path": "k8s", "branch": "main"}),
                json!({"name": "api"}),
            ],
        };
        let text = plan_text(&loaded).unwrap();

        assert!(text.starts_with("Stack dev (cluster eks-cluster-dev), 16 nodes\n[0]\n"));
        let position = |needle: &str| text.find(needle).unwrap();
        assert!(position("cluster-role [role]") < position("eks-cluster [cluster]"));
        assert!(position("k8s-provider [api-client]") < position("cluster-init-job [job]"));
        assert!(position("cluster-init-job [job]") < position("app-web [application-record]"));
        assert!(text.contains("rejected: malformed entry #1"));
    }
}
