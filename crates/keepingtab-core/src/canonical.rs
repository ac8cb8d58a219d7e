//! Canonical CBOR encoding for tabs and change events.
//!
//! Tabs are encoded as CBOR maps with small integer keys in ascending order,
//! definite lengths and no floats. The same tab always produces identical
//! bytes, which makes state hashes comparable across processes.
//!
//! Change events use the serde encoding and are only stored for dead-letter
//! inspection, so they need a round trip but not byte stability.

use ciborium::value::Value;

use crate::error::CoreError;
use crate::event::ChangeEvent;
use crate::tab::Tab;

/// Tab field keys (integer keys for compact encoding).
///
/// Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const ID: u64 = 0;
    pub const URL: u64 = 1;
    pub const TITLE: u64 = 2;
    pub const LAST_MODIFIED: u64 = 3;
    pub const DELETED: u64 = 4;
    pub const ORIGIN: u64 = 5;
}

/// Encode a tab to canonical CBOR bytes.
pub fn canonical_tab_bytes(tab: &Tab) -> Result<Vec<u8>, CoreError> {
    let value = Value::Map(vec![
        (key(keys::ID), Value::Text(tab.id.as_str().to_string())),
        (key(keys::URL), Value::Text(tab.url.clone())),
        (key(keys::TITLE), Value::Text(tab.title.clone())),
        (
            key(keys::LAST_MODIFIED),
            Value::Integer(tab.last_modified.get().into()),
        ),
        (key(keys::DELETED), Value::Bool(tab.deleted)),
        (key(keys::ORIGIN), Value::Text(tab.origin.as_str().to_string())),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Encode a change event to CBOR.
pub fn encode_event(event: &ChangeEvent) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(event, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Decode a change event from CBOR.
pub fn decode_event(bytes: &[u8]) -> Result<ChangeEvent, CoreError> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

fn key(k: u64) -> Value {
    Value::Integer(k.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_bytes_deterministic() {
        let tab = Tab::new("t1", "laptop", 42).with_url("https://a.example");
        let b1 = canonical_tab_bytes(&tab).unwrap();
        let b2 = canonical_tab_bytes(&tab.clone()).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn test_tab_bytes_start_with_six_entry_map() {
        let tab = Tab::new("t1", "laptop", 1);
        let bytes = canonical_tab_bytes(&tab).unwrap();
        // Major type 5 (map) with 6 entries.
        assert_eq!(bytes[0], 0xa6);
        // First key is the integer 0.
        assert_eq!(bytes[1], 0x00);
    }

    #[test]
    fn test_tombstone_changes_bytes() {
        let tab = Tab::new("t1", "laptop", 1);
        let dead = tab.clone().tombstoned();
        assert_ne!(
            canonical_tab_bytes(&tab).unwrap(),
            canonical_tab_bytes(&dead).unwrap()
        );
    }

    #[test]
    fn test_event_cbor_roundtrip() {
        let event = ChangeEvent::upsert(Tab::new("t1", "laptop", 7).with_title("news"), 3);
        let bytes = encode_event(&event).unwrap();
        assert_eq!(decode_event(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_event(&[0xff, 0x00]).is_err());
    }
}
