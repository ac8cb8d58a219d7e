//! Error types for KeepingTab core.

use thiserror::Error;

use crate::types::TabId;

/// Core errors outside of event validation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Reasons a change event is malformed.
///
/// A malformed event is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event has no tab id")]
    MissingTabId,

    #[error("event has no origin")]
    MissingOrigin,

    #[error("event for tab {0} has no timestamp")]
    MissingTimestamp(TabId),

    #[error("event for tab {tab} has timestamp {time} above the maximum {max}")]
    TimestampOutOfRange { tab: TabId, time: u64, max: u64 },

    #[error("event for tab {0} has sequence 0")]
    InvalidSequence(TabId),

    #[error("snapshot id {snapshot} does not match event tab id {event}")]
    IdMismatch { event: TabId, snapshot: TabId },

    #[error("snapshot origin {snapshot} does not match event origin {event}")]
    OriginMismatch { event: String, snapshot: String },

    #[error("{field} exceeds maximum length of {max} bytes (got {len})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::EncodingError(msg) | CoreError::DecodingError(msg) => {
                ValidationError::StructuralError(msg)
            }
        }
    }
}
