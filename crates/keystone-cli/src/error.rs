//! Error types for the CLI

use std::path::PathBuf;

use keystone_graph::{ExecutionError, GraphError};
use keystone_provision::StackError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] keystone_common::Error),

    #[error("{0}")]
    Stack(#[from] StackError),

    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Execution(#[from] ExecutionError),

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}
