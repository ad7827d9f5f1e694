//! Error types for peerchat-core.

use thiserror::Error;

/// Errors raised by the durable key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("cannot encode chat state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that can occur during chat operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no local user has joined")]
    NotJoined,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("broadcast bus error: {0}")]
    Bus(String),

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Result type alias for peerchat-core operations.
pub type Result<T> = std::result::Result<T, Error>;
