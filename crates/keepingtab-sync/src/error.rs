//! Error types for the sync module.

use thiserror::Error;

use keepingtab_core::PartitionId;

/// Errors reported by a change queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The broker cannot be reached right now. Always retried.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The subscription was closed and will not deliver again.
    #[error("queue closed")]
    Closed,

    /// Partition outside the broker's partition range.
    #[error("unknown partition {partition} (broker has {count})")]
    UnknownPartition { partition: PartitionId, count: u32 },

    /// Ack or nack for a delivery that is not in flight.
    #[error("delivery {offset} on {partition} is not in flight")]
    NotInFlight { partition: PartitionId, offset: u64 },
}

impl QueueError {
    /// Whether waiting and retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Errors that stop a sync worker.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] keepingtab_store::StoreError),

    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Event validation failed.
    #[error("validation error: {0}")]
    Validation(#[from] keepingtab_core::ValidationError),

    /// Encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] keepingtab_core::CoreError),

    /// A partition worker kept panicking.
    #[error("worker for {partition} panicked {restarts} times, giving up")]
    RestartsExhausted { partition: PartitionId, restarts: u32 },

    /// A worker task failed to run to completion.
    #[error("worker task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether the error means local storage can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
