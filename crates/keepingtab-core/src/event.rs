//! ChangeEvent: a single mutation of a tab produced by a client device.

use serde::{Deserialize, Serialize};

use crate::tab::{MergeKey, Tab, TabDiff};
use crate::types::{LogicalTime, OriginId, TabId};

/// The kind of change an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create or update a tab.
    Upsert,
    /// Tombstone a tab.
    Delete,
}

impl Operation {
    /// Stable name used in logs and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// Payload of a change: a full snapshot or a partial diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangePayload {
    /// Full tab state after the change.
    Snapshot(Tab),
    /// Only the changed fields.
    Diff(TabDiff),
}

impl ChangePayload {
    /// The logical time carried by the payload, if any.
    pub fn last_modified(&self) -> Option<LogicalTime> {
        match self {
            Self::Snapshot(tab) => Some(tab.last_modified),
            Self::Diff(diff) => diff.last_modified,
        }
        .filter(|t| !t.is_zero())
    }
}

/// A change to one tab, as delivered by the change queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The tab being changed.
    pub tab_id: TabId,
    /// Device that produced the change.
    pub origin: OriginId,
    /// Upsert or delete.
    pub operation: Operation,
    /// Snapshot or diff.
    pub payload: ChangePayload,
    /// Monotonic per-origin counter, starting at 1.
    pub sequence: u64,
}

impl ChangeEvent {
    /// Build an upsert carrying a full snapshot of `tab`.
    pub fn upsert(tab: Tab, sequence: u64) -> Self {
        Self {
            tab_id: tab.id.clone(),
            origin: tab.origin.clone(),
            operation: Operation::Upsert,
            payload: ChangePayload::Snapshot(tab),
            sequence,
        }
    }

    /// Build an upsert carrying a diff.
    pub fn upsert_diff(
        tab_id: impl Into<TabId>,
        origin: impl Into<OriginId>,
        diff: TabDiff,
        sequence: u64,
    ) -> Self {
        Self {
            tab_id: tab_id.into(),
            origin: origin.into(),
            operation: Operation::Upsert,
            payload: ChangePayload::Diff(diff),
            sequence,
        }
    }

    /// Build a delete at the given logical time.
    pub fn delete(
        tab_id: impl Into<TabId>,
        origin: impl Into<OriginId>,
        last_modified: u64,
        sequence: u64,
    ) -> Self {
        Self {
            tab_id: tab_id.into(),
            origin: origin.into(),
            operation: Operation::Delete,
            payload: ChangePayload::Diff(TabDiff::at(last_modified)),
            sequence,
        }
    }

    /// Check if this is a delete.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Logical time of the change; `None` if missing or zero.
    pub fn last_modified(&self) -> Option<LogicalTime> {
        self.payload.last_modified()
    }

    /// The version this event would install, in merge order.
    pub fn merge_key(&self) -> Option<MergeKey> {
        self.last_modified().map(|last_modified| MergeKey {
            last_modified,
            is_delete: self.is_delete(),
            origin: self.origin.clone(),
        })
    }
}
