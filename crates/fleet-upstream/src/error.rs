//! Error types for the upstream engine

use thiserror::Error;

use fleet_core::{BusError, GraphError};

/// Errors that can occur while synchronizing with an upstream
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Reconciliation was asked for a node the local store does not have
    #[error("Local node not found: {parent}/{id}")]
    LocalNodeMissing { parent: String, id: String },

    /// Upstream node never showed its type within the retry budget
    #[error("Upstream node {id} not visible after {attempts} attempts")]
    NodeNotVisible { id: String, attempts: u32 },

    /// Bus operation failed
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Engine task has stopped
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Engine task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<GraphError> for UpstreamError {
    fn from(e: GraphError) -> Self {
        UpstreamError::Bus(e.into())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for UpstreamError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        UpstreamError::ChannelClosed(e.to_string())
    }
}

impl From<tokio::task::JoinError> for UpstreamError {
    fn from(e: tokio::task::JoinError) -> Self {
        UpstreamError::Task(e.to_string())
    }
}

/// Result type alias for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;
