//! Core error types for `Harvest`.

use thiserror::Error;

/// Core error type for `Harvest` operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value used to build an identifier was empty.
    #[error("Identifier part cannot be empty")]
    EmptyIdentifierPart,

    /// Invalid data from an API response.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
