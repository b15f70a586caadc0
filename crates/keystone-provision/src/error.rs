//! Errors raised while assembling the stack graph

use keystone_graph::GraphError;
use thiserror::Error;

/// Why the stack graph could not be built
#[derive(Debug, Error)]
pub enum StackError {
    /// The configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(#[source] keystone_common::Error),

    /// A manifest could not be rendered
    #[error("failed to render manifest: {0}")]
    Manifest(#[source] keystone_common::Error),

    /// Node wiring was rejected by the graph
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl StackError {
    /// The underlying graph error, if any
    pub fn graph_error(&self) -> Option<&GraphError> {
        match self {
            StackError::Graph(e) => Some(e),
            _ => None,
        }
    }
}
