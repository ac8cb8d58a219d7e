//! Error types for the service.

use keepingtab_store::StoreError;
use keepingtab_sync::SyncError;
use thiserror::Error;

/// Configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `KEEPINGTAB_*` variable that is not recognized.
    #[error("unknown configuration variable: {0}")]
    UnknownVariable(String),

    /// A variable whose value cannot be parsed.
    #[error("invalid value for {variable}: {value:?}")]
    Parse { variable: String, value: String },

    /// A setting outside its allowed range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    /// Malformed JSON configuration.
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while running the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The queue does not have the configured number of partitions.
    #[error("queue has {actual} partitions, configured for {configured}")]
    PartitionMismatch { configured: u32, actual: u32 },

    /// Logging could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// A background task failed to complete.
    #[error("background task failed: {0}")]
    Task(String),
}

impl ServiceError {
    /// Whether the error means local storage can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_fatal(),
            ServiceError::Sync(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
