//! Up command - bring the whole stack up

use std::fmt::Write;

use clap::Args;
use keystone_graph::{DependencyGraph, Executor, FailedRun, ProvisionSequence};
use keystone_provision::{build_stack, Collaborators};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{plan, StackArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct UpArgs {
    #[command(flatten)]
    pub stack: StackArgs,

    /// Dry run - print the plan without creating anything
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(args: UpArgs) -> Result<()> {
    let loaded = args.stack.load()?;
    if args.dry_run {
        print!("{}", plan::plan_text(&loaded)?);
        return Ok(());
    }

    let collaborators = Collaborators::production(loaded.config.region.clone());
    let stack = build_stack(&loaded.config, &loaded.applications, &collaborators)?;

    let cancel = CancellationToken::new();
    let executor = Executor::new()
        .with_retry(loaded.config.retry())
        .with_cancellation(cancel.clone());

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, no further resources will be started");
            cancel.cancel();
        }
    });
    let result = executor.run(stack.graph).await;
    interrupt.abort();

    match result {
        Ok(completed) => {
            print!("{}", summary(completed.graph()));
            info!(
                stack = %loaded.config.stack_name,
                cluster = %loaded.config.cluster_name(),
                "Stack is up"
            );
            Ok(())
        }
        Err(e) => {
            if let Some(run) = e.failed_run() {
                print!("{}", summary(run.completed.graph()));
                eprint!("{}", failure_report(run));
            }
            Err(e.into())
        }
    }
}

/// One line per node in provisioning order: id, kind and final state
pub fn summary(graph: &DependencyGraph) -> String {
    let ids = ProvisionSequence::from_graph(graph)
        .map(|s| s.all_ids_in_order())
        .unwrap_or_else(|_| graph.ids());

    let mut out = format!("{:<40} {:<20} {}\n", "NODE", "KIND", "STATE");
    for id in ids {
        if let Some(node) = graph.get(&id) {
            let _ = writeln!(out, "{:<40} {:<20} {}", id, node.kind().as_str(), node.state());
        }
    }
    out
}

/// Every failed branch with its cause, then what was skipped or abandoned
pub fn failure_report(run: &FailedRun) -> String {
    let mut out = String::new();
    for failure in &run.failures {
        let _ = writeln!(out, "FAILED {}", failure);
    }
    for skipped in &run.poisoned {
        let _ = writeln!(out, "skipped {} ({})", skipped.id, skipped.cause);
    }
    if !run.abandoned.is_empty() {
        let _ = writeln!(out, "never started: {}", run.abandoned.join(", "));
    }
    out
}
