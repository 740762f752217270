//! Error types for supervisor operations

use conclave_core::error::ConclaveError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {0} is not running")]
    NodeNotRunning(String),

    #[error("Failed to spawn node {node}: {message}")]
    Spawn { node: String, message: String },

    #[error("Nodes not ready after {timeout:?}: {}", .nodes.join(", "))]
    ReadyTimeout {
        timeout: Duration,
        nodes: Vec<String>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to connect {from} -> {to}: {message}")]
    ConnectFailed {
        from: String,
        to: String,
        message: String,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Core(#[from] ConclaveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors talking to a node's control socket
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Control socket for node {node} not found at {}", .path.display())]
    SocketMissing { node: String, path: PathBuf },

    #[error("Timed out after {timeout:?} waiting for node {node}")]
    Timeout { node: String, timeout: Duration },

    #[error("Node {node} closed the connection without a response")]
    Closed { node: String },

    #[error("IO error talking to node {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error from node {node}: {message}")]
    Protocol { node: String, message: String },
}

impl ClientError {
    /// Node the failed call was addressed to
    pub fn node(&self) -> &str {
        match self {
            ClientError::SocketMissing { node, .. }
            | ClientError::Timeout { node, .. }
            | ClientError::Closed { node }
            | ClientError::Io { node, .. }
            | ClientError::Protocol { node, .. } => node,
        }
    }
}
