//! Store error types.

use harvest_fetch::{ArchiveError, FetchError};
use thiserror::Error;

/// Errors that can occur in the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No archive at the given path.
    #[error("Archive not found: {0}")]
    NotFound(String),

    /// The archive contents are invalid.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for ArchiveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Archive(inner) => inner,
            StoreError::Io(inner) => ArchiveError::Io(inner),
            StoreError::Serialization(inner) => ArchiveError::Serialization(inner),
            other => ArchiveError::Storage(other.to_string()),
        }
    }
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Config(msg) => FetchError::InvalidConfig(msg),
            other => ArchiveError::from(other).into(),
        }
    }
}
