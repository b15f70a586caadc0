//! Validate command - check the stack file and application list

use clap::Args;
use keystone_graph::ProvisionSequence;
use keystone_provision::{build_stack, Collaborators};

use super::{LoadedStack, StackArgs};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub stack: StackArgs,
}

pub async fn run(args: ValidateArgs) -> Result<()> {
    let loaded = args.stack.load()?;
    let report = validate(&loaded)?;
    println!("{}", report);
    Ok(())
}

/// Build the graph and resolve its order; every rejected application entry
/// is an error.
pub fn validate(loaded: &LoadedStack) -> Result<String> {
    let collaborators = Collaborators::production(loaded.config.region.clone());
    let stack = build_stack(&loaded.config, &loaded.applications, &collaborators)?;
    let sequence = ProvisionSequence::from_graph(&stack.graph)?;

    if !stack.malformed.is_empty() {
        let problems: Vec<String> = stack.malformed.iter().map(|e| format!("  {}", e)).collect();
        return Err(Error::validation(format!(
            "{} application entr{} rejected:\n{}",
            problems.len(),
            if problems.len() == 1 { "y" } else { "ies" },
            problems.join("\n")
        )));
    }

    Ok(format!(
        "stack {} is valid: {} nodes in {} ready sets, {} application(s)",
        loaded.config.stack_name,
        sequence.total_nodes(),
        sequence.num_groups(),
        loaded.applications.len()
    ))
}
