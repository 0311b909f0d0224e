//! Error types for store operations.

use bibsync_protocol::LibraryIdentifier;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local store or file storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A cached payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The library is not known to the store.
    #[error("library not found: {0}")]
    LibraryNotFound(LibraryIdentifier),

    /// The transaction was aborted and nothing was committed.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// The stored data is inconsistent.
    #[error("store corrupted: {0}")]
    Corrupted(String),
}
