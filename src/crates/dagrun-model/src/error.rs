//! Error types for model and sink operations

use thiserror::Error;

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur when serializing snapshots or shipping them to a sink
#[derive(Error, Debug)]
pub enum ModelError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote sink rejected a write
    #[error("Sink error: {0}")]
    Sink(String),

    /// Lookup failed (e.g. unknown child run)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}
