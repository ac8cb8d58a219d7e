//! Error types for the store module.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Record serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid data in storage (row cannot be decoded).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Value cannot be represented in storage.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// A lock guarding in-process state was poisoned by a panic.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    /// Backend temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Background task running a blocking operation failed.
    #[error("blocking task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error means local storage can no longer be trusted.
    ///
    /// Fatal errors stop the process; everything else may be retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase)
            ),
            StoreError::InvalidData(_) | StoreError::Poisoned(_) | StoreError::Migration(_) => true,
            _ => false,
        }
    }

    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        !self.is_fatal()
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
