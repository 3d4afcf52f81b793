//! Store error types.

use thiserror::Error;

/// Store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store has not been opened, or has been closed.
    #[error("store is closed")]
    Closed,

    /// A bounded store without eviction is full.
    #[error("capacity exceeded: store holds at most {capacity} entries")]
    CapacityExceeded { capacity: usize },

    /// Injected or backend-specific failure.
    #[error("store failure: {0}")]
    Backend(String),
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
