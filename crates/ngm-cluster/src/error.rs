//! Error types for the cluster and resource broker ports.

use thiserror::Error;

/// Result type alias for collaborator calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by [`ClusterClient`](crate::ClusterClient) and
/// [`ResourceManager`](crate::ResourceManager) implementations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}
