//! Tab: a synchronizable browser-tab record.
//!
//! A tab is identified by a stable [`TabId`] and versioned by the pair
//! `(last_modified, origin)`. Deletion keeps the row as a tombstone.
//!
//! Each content field also remembers the version that last wrote it, so a
//! diff that only touches one field can be merged in any order against
//! diffs touching the other.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::{LogicalTime, OriginId, TabId};

/// Maximum accepted length of a tab id, in bytes.
pub const MAX_TAB_ID_LEN: usize = 256;

/// Maximum accepted length of an origin id, in bytes.
pub const MAX_ORIGIN_LEN: usize = 128;

/// Maximum accepted length of a tab url, in bytes.
pub const MAX_URL_LEN: usize = 8 * 1024;

/// Maximum accepted length of a tab title, in bytes.
pub const MAX_TITLE_LEN: usize = 2 * 1024;

/// Largest accepted logical time. Storage keeps timestamps as signed 64-bit
/// integers.
pub const MAX_LOGICAL_TIME: u64 = i64::MAX as u64;

/// A tab record as stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    /// Stable identifier, immutable once created.
    pub id: TabId,
    /// Page url.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Logical time of the last mutation.
    pub last_modified: LogicalTime,
    /// Tombstone flag.
    pub deleted: bool,
    /// Device that produced the last mutation.
    pub origin: OriginId,
    /// Versions of fields last written by an older change.
    #[serde(default, skip_serializing_if = "FieldVersions::is_empty")]
    pub fields: FieldVersions,
}

impl Tab {
    /// Create a live tab with empty url and title.
    pub fn new(id: impl Into<TabId>, origin: impl Into<OriginId>, last_modified: u64) -> Self {
        Self {
            id: id.into(),
            url: String::new(),
            title: String::new(),
            last_modified: LogicalTime(last_modified),
            deleted: false,
            origin: origin.into(),
            fields: FieldVersions::default(),
        }
    }

    /// Set the url.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Mark as a tombstone.
    pub fn tombstoned(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Check if this tab is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// The version of this tab in merge order.
    pub fn merge_key(&self) -> MergeKey {
        MergeKey {
            last_modified: self.last_modified,
            is_delete: self.deleted,
            origin: self.origin.clone(),
        }
    }

    /// The version that last wrote the url.
    pub fn url_version(&self) -> MergeKey {
        self.fields.url.clone().unwrap_or_else(|| self.merge_key())
    }

    /// The version that last wrote the title.
    pub fn title_version(&self) -> MergeKey {
        self.fields.title.clone().unwrap_or_else(|| self.merge_key())
    }

    /// Check if this tab is a strictly newer state of `other`.
    ///
    /// True when no version (record, url, title) went backwards and at least
    /// one moved forward. Merging only ever produces superseding states.
    pub fn supersedes(&self, other: &Tab) -> bool {
        let pairs = [
            (self.merge_key(), other.merge_key()),
            (self.url_version(), other.url_version()),
            (self.title_version(), other.title_version()),
        ];
        pairs.iter().all(|(a, b)| a >= b) && pairs.iter().any(|(a, b)| a > b)
    }
}

/// Field versions that differ from the tab's own version.
///
/// `None` means the field was written by the change that produced the tab's
/// `(last_modified, origin)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldVersions {
    /// Version of the url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<MergeKey>,
    /// Version of the title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<MergeKey>,
}

impl FieldVersions {
    /// Check if every field follows the tab's own version.
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.title.is_none()
    }
}

/// A partial update to a tab.
///
/// Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabDiff {
    /// New url, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// New title, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Logical time of this change. Required.
    #[serde(default)]
    pub last_modified: Option<LogicalTime>,
}

impl TabDiff {
    /// Create an empty diff at the given time.
    pub fn at(last_modified: u64) -> Self {
        Self {
            url: None,
            title: None,
            last_modified: Some(LogicalTime(last_modified)),
        }
    }

    /// Set the url.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Total order used to decide which version of a tab wins.
///
/// Ordered by `last_modified`, then deletes above upserts at the same time,
/// then `origin`. The delete rank makes a tombstone win any exact timestamp
/// tie against a live version, whichever arrives first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeKey {
    /// Logical time of the version.
    pub last_modified: LogicalTime,
    /// Whether the version is a delete.
    pub is_delete: bool,
    /// Origin of the version.
    pub origin: OriginId,
}

impl MergeKey {
    /// Version of a field no change has written yet. Below every valid
    /// change, which needs a non-zero time and a non-empty origin.
    pub fn unset() -> Self {
        Self {
            last_modified: LogicalTime::ZERO,
            is_delete: false,
            origin: OriginId::new(""),
        }
    }
}

impl Ord for MergeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_modified
            .cmp(&other.last_modified)
            .then(self.is_delete.cmp(&other.is_delete))
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for MergeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_key_orders_by_time_first() {
        let older = Tab::new("t", "z", 10).merge_key();
        let newer = Tab::new("t", "a", 11).merge_key();
        assert!(newer > older);
    }

    #[test]
    fn test_merge_key_delete_beats_upsert_on_tie() {
        let live = Tab::new("t", "z", 10).merge_key();
        let dead = Tab::new("t", "a", 10).tombstoned().merge_key();
        assert!(dead > live);
    }

    #[test]
    fn test_merge_key_origin_breaks_tie() {
        let a = Tab::new("t", "a", 10).merge_key();
        let b = Tab::new("t", "b", 10).merge_key();
        assert!(b > a);
    }

    #[test]
    fn test_unset_is_below_any_change() {
        assert!(MergeKey::unset() < Tab::new("t", "a", 1).merge_key());
    }

    #[test]
    fn test_field_versions_follow_record_by_default() {
        let tab = Tab::new("t", "a", 4);
        assert_eq!(tab.url_version(), tab.merge_key());
        assert_eq!(tab.title_version(), tab.merge_key());
    }

    #[test]
    fn test_supersedes_needs_progress_without_regress() {
        let base = Tab::new("t", "a", 5);
        assert!(Tab::new("t", "a", 6).supersedes(&base));
        assert!(!base.supersedes(&base));
        assert!(!Tab::new("t", "a", 4).supersedes(&base));

        // Same record version, newer title.
        let mut partial = Tab::new("t", "b", 9);
        partial.fields.url = Some(Tab::new("t", "a", 3).merge_key());
        let mut newer = partial.clone();
        newer.fields.url = Some(Tab::new("t", "c", 4).merge_key());
        assert!(newer.supersedes(&partial));
        assert!(!partial.supersedes(&newer));
    }

    #[test]
    fn test_field_versions_omitted_when_empty() {
        let json = serde_json::to_value(Tab::new("t", "a", 1)).unwrap();
        assert!(json.get("fields").is_none());
    }

    #[test]
    fn test_diff_json_missing_timestamp() {
        let diff: TabDiff = serde_json::from_str(r#"{"title":"x"}"#).unwrap();
        assert_eq!(diff.last_modified, None);
    }
}
