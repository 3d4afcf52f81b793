//! Repository error types.

use aggregation_store::StoreError;
use thiserror::Error;

use crate::codec::CodecError;

/// Repository error type.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Invalid configuration; raised before the repository starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store failure, with the repository and key it concerned.
    #[error("store error in repository {repository} for key {key}: {source}")]
    Store {
        repository: String,
        key: String,
        source: StoreError,
    },

    /// Snapshot could not be marshalled or unmarshalled.
    #[error("codec error in repository {repository} for key {key}: {source}")]
    Codec {
        repository: String,
        key: String,
        source: CodecError,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RepositoryError {
    /// The underlying store error, if this is one.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            RepositoryError::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias using RepositoryError.
pub type RepositoryResult<T> = Result<T, RepositoryError>;
