//! Common error types for FieldSync.

use thiserror::Error;

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// The local store has not been initialized for a project yet.
    #[error("Local store not initialized")]
    NotInitialized,

    /// Remote delta client failed.
    #[error("Remote error: {0}")]
    Remote(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The sync scheduler is not running.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Whether this error means the local store itself is unusable.
    ///
    /// Such errors abort a sync run instead of being recorded per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Store(_) | Error::NotInitialized | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
