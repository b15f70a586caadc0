//! keystone CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// keystone - bring up a Kubernetes cluster and its add-on stack
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create every resource in dependency order
    Up(commands::up::UpArgs),
    /// Print the provisioning order without creating anything
    Plan(commands::plan::PlanArgs),
    /// Check the stack file and application list
    Validate(commands::validate::ValidateArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Up(args) => commands::up::run(args).await,
            Commands::Plan(args) => commands::plan::run(args).await,
            Commands::Validate(args) => commands::validate::run(args).await,
        }
    }
}
