//! Storage error handling
//!
//! Every operation in the storage layer reports failures through
//! [`StorageError`], regardless of whether the engine runs in-process or
//! behind the worker transport.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::engine::DatabaseHandle;

/// Errors that can occur during storage operations
///
/// Errors carry rendered messages rather than source errors so they can be
/// cloned. A finished [`ResultStream`](crate::ResultStream) replays its
/// terminal error on every further `next()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The engine could not open or create a database at the path
    #[error("Cannot open database at '{path}': {message}")]
    EngineUnavailable { path: PathBuf, message: String },

    /// The handle does not refer to an open connection
    #[error("Unknown database handle {0}")]
    UnknownHandle(DatabaseHandle),

    /// The engine rejected a statement
    #[error("{0}")]
    Engine(String),

    /// The execution context serving the backend is gone
    #[error("Storage transport closed")]
    TransportClosed,

    /// The handle owning a result stream was closed mid-iteration
    #[error("Result stream aborted: handle closed")]
    StreamAborted,

    /// A parameter value could not be converted to an engine value
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The store was used before `init()` or after `shutdown()`
    #[error("Store is not initialized")]
    NotInitialized,

    /// Removing database storage failed
    #[error("Failed to remove '{path}': {message}")]
    Io { path: PathBuf, message: String },
}

impl StorageError {
    /// Create an error from an I/O error with path context
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        StorageError::Io {
            path,
            message: error.to_string(),
        }
    }

    /// Whether the backend that produced this error must be re-initialized
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::TransportClosed)
    }

    /// Whether this error is a lifecycle bug in the caller rather than a
    /// runtime condition
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            StorageError::UnknownHandle(_) | StorageError::NotInitialized
        )
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(error: rusqlite::Error) -> Self {
        StorageError::Engine(error.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
