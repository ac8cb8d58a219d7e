//! Change event validation: structural checks applied before merging.

use crate::error::ValidationError;
use crate::event::{ChangeEvent, ChangePayload};
use crate::tab::{MAX_LOGICAL_TIME, MAX_ORIGIN_LEN, MAX_TAB_ID_LEN, MAX_TITLE_LEN, MAX_URL_LEN};

/// Validate a change event's structure.
///
/// This performs:
/// - Identity checks (tab id, origin present and within limits)
/// - Timestamp presence (non-zero `last_modified`) and range
/// - Sequence check (per-origin counters start at 1)
/// - Snapshot consistency (snapshot id and origin match the envelope)
/// - Field length limits
pub fn validate_event(event: &ChangeEvent) -> Result<(), ValidationError> {
    // 1. Identity
    if event.tab_id.is_empty() {
        return Err(ValidationError::MissingTabId);
    }
    check_len("tab_id", event.tab_id.as_str().len(), MAX_TAB_ID_LEN)?;

    if event.origin.is_empty() {
        return Err(ValidationError::MissingOrigin);
    }
    check_len("origin", event.origin.as_str().len(), MAX_ORIGIN_LEN)?;

    // 2. Timestamp
    let time = event
        .last_modified()
        .ok_or_else(|| ValidationError::MissingTimestamp(event.tab_id.clone()))?;
    if time.get() > MAX_LOGICAL_TIME {
        return Err(ValidationError::TimestampOutOfRange {
            tab: event.tab_id.clone(),
            time: time.get(),
            max: MAX_LOGICAL_TIME,
        });
    }

    // 3. Sequence
    if event.sequence == 0 {
        return Err(ValidationError::InvalidSequence(event.tab_id.clone()));
    }

    // 4. Payload
    match &event.payload {
        ChangePayload::Snapshot(tab) => {
            if tab.id != event.tab_id {
                return Err(ValidationError::IdMismatch {
                    event: event.tab_id.clone(),
                    snapshot: tab.id.clone(),
                });
            }
            if tab.origin != event.origin {
                return Err(ValidationError::OriginMismatch {
                    event: event.origin.to_string(),
                    snapshot: tab.origin.to_string(),
                });
            }
            check_len("url", tab.url.len(), MAX_URL_LEN)?;
            check_len("title", tab.title.len(), MAX_TITLE_LEN)?;
        }
        ChangePayload::Diff(diff) => {
            if let Some(url) = &diff.url {
                check_len("url", url.len(), MAX_URL_LEN)?;
            }
            if let Some(title) = &diff.title {
                check_len("title", title.len(), MAX_TITLE_LEN)?;
            }
        }
    }

    Ok(())
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), ValidationError> {
    if len > max {
        return Err(ValidationError::FieldTooLong { field, len, max });
    }
    Ok(())
}
