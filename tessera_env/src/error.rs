//! Error types for the tessera environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network operation failed (link closed, unknown address, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target node is unreachable (partition or crashed node)
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Storage collaborator rejected or lost a request
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageError(msg.into())
    }
}
