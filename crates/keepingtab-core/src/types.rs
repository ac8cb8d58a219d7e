//! Strong type definitions for KeepingTab.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable unique identifier of a tab record.
///
/// Assigned by the device that first created the tab and never changed
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    /// Create a tab id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id marks a malformed event.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TabId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the device or client that produced a change.
///
/// Ordered lexicographically; the order breaks exact timestamp ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    /// Create an origin id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OriginId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Logical modification time of a tab.
///
/// Zero is reserved: an event carrying it has no usable timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    /// The reserved "no timestamp" value.
    pub const ZERO: Self = Self(0);

    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Check if this is the reserved zero value.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// A partition of the change queue.
///
/// All events from one origin map to the same partition, so per-origin
/// ordering holds inside a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Map an origin onto one of `partition_count` partitions.
    ///
    /// Uses Blake3 so the mapping is stable across processes and platforms.
    /// A `partition_count` of zero is treated as one.
    pub fn for_origin(origin: &OriginId, partition_count: u32) -> Self {
        let count = partition_count.max(1);
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"keepingtab-partition-v0:");
        hasher.update(origin.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Self((u64::from_le_bytes(head) % u64::from(count)) as u32)
    }

    /// Get the raw partition number.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identity of a queue consumer; cursors are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Create a consumer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new("keepingtab-sync")
    }
}
