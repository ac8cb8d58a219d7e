//! TabStore trait: the abstract interface for tab persistence.
//!
//! This trait allows the sync coordinator to be storage-agnostic.
//! Implementations include SQLite (primary) and in-memory (for tests).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use keepingtab_core::{ConsumerId, OriginId, PartitionId, Tab, TabId};

use crate::error::Result;

/// Result of writing a tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The tab was written.
    Written,
    /// The stored tab is not older than the new one; nothing was written.
    Conflict {
        /// The stored tab that won.
        current: Tab,
    },
}

/// Result of physically removing a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The row was removed.
    Deleted,
    /// No row with that id.
    NotFound,
}

/// Durable position of a consumer in one partition of the change queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// The consumer owning the cursor.
    pub consumer: ConsumerId,
    /// The partition the offset refers to.
    pub partition: PartitionId,
    /// Offset of the last settled event.
    pub offset: u64,
    /// When the cursor was last persisted (Unix ms).
    pub updated_at: i64,
}

/// An event that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Partition the event was delivered on.
    pub partition: PartitionId,
    /// Queue offset of the event.
    pub offset: u64,
    /// Tab the event targeted.
    pub tab_id: TabId,
    /// Origin of the event.
    pub origin: OriginId,
    /// Per-origin sequence number of the event.
    pub sequence: u64,
    /// Why the event was rejected.
    pub reason: String,
    /// How many delivery attempts were made.
    pub attempts: u32,
    /// The event, CBOR encoded.
    pub event: Vec<u8>,
    /// When the dead letter was recorded (Unix ms).
    pub recorded_at: i64,
}

/// The TabStore trait: async interface for tab persistence.
///
/// All methods are async to support both blocking (SQLite) and async
/// backends. For SQLite, `spawn_blocking` keeps the runtime free.
///
/// # Design Notes
///
/// - **Per-id atomicity**: `put` is a compare-and-set on the stored
///   versions. It only writes when the new tab
///   [supersedes](keepingtab_core::Tab::supersedes) the stored one, and
///   reports `Conflict` otherwise. Concurrent writers to the same id
///   serialize through it.
/// - **Tombstones**: deleted tabs stay as rows stamped with the local time
///   they were tombstoned; `purge_tombstones` removes expired ones.
/// - **Errors are surfaced**: a failed write is never reported as success.
#[async_trait]
pub trait TabStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Tab Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a tab by id. Tombstones are returned too.
    async fn get(&self, id: &TabId) -> Result<Option<Tab>>;

    /// Write a tab if it supersedes the stored version.
    async fn put(&self, tab: &Tab) -> Result<PutOutcome>;

    /// Physically remove a tab.
    async fn delete(&self, id: &TabId) -> Result<DeleteOutcome>;

    /// Get up to `limit` tabs with id greater than `after`, ordered by id.
    async fn list_page(&self, after: Option<&TabId>, limit: usize) -> Result<Vec<Tab>>;

    /// Count stored rows, tombstones included.
    async fn count(&self) -> Result<u64>;

    /// Remove tombstones stamped before `before` (Unix ms).
    ///
    /// Returns the number of rows removed. Live tabs and tombstones
    /// replaced by a newer live version are never touched.
    async fn purge_tombstones(&self, before: i64) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Cursor Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the persisted cursor of a consumer for a partition.
    async fn load_cursor(
        &self,
        consumer: &ConsumerId,
        partition: PartitionId,
    ) -> Result<Option<SyncCursor>>;

    /// Persist a cursor, replacing the previous one.
    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Dead-letter Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a dead letter.
    ///
    /// Idempotent per `(partition, offset)`: returns false if already recorded.
    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<bool>;

    /// All dead letters, ordered by partition and offset.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

#[async_trait]
impl<S: TabStore + ?Sized> TabStore for Arc<S> {
    async fn get(&self, id: &TabId) -> Result<Option<Tab>> {
        (**self).get(id).await
    }

    async fn put(&self, tab: &Tab) -> Result<PutOutcome> {
        (**self).put(tab).await
    }

    async fn delete(&self, id: &TabId) -> Result<DeleteOutcome> {
        (**self).delete(id).await
    }

    async fn list_page(&self, after: Option<&TabId>, limit: usize) -> Result<Vec<Tab>> {
        (**self).list_page(after, limit).await
    }

    async fn count(&self) -> Result<u64> {
        (**self).count().await
    }

    async fn purge_tombstones(&self, before: i64) -> Result<u64> {
        (**self).purge_tombstones(before).await
    }

    async fn load_cursor(
        &self,
        consumer: &ConsumerId,
        partition: PartitionId,
    ) -> Result<Option<SyncCursor>> {
        (**self).load_cursor(consumer, partition).await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        (**self).save_cursor(cursor).await
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<bool> {
        (**self).record_dead_letter(letter).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        (**self).list_dead_letters().await
    }
}

/// Default page size for [`StoreExt::scan`].
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// Lazy, paged iteration over all tabs in id order.
///
/// Pages are fetched on demand, so enumerating a large store holds at most
/// one page in memory.
pub struct TabScan<'a, S: TabStore + ?Sized> {
    store: &'a S,
    page_size: usize,
    after: Option<TabId>,
    buffer: VecDeque<Tab>,
    exhausted: bool,
}

impl<'a, S: TabStore + ?Sized> TabScan<'a, S> {
    fn new(store: &'a S, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Get the next tab, fetching a page if needed.
    pub async fn next(&mut self) -> Result<Option<Tab>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .list_page(self.after.as_ref(), self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.after = Some(last.id.clone());
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the remaining tabs into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<Tab>> {
        let mut tabs = Vec::new();
        while let Some(tab) = self.next().await? {
            tabs.push(tab);
        }
        Ok(tabs)
    }
}

/// Extension trait for common store patterns.
pub trait StoreExt: TabStore {
    /// Lazily enumerate all tabs.
    fn scan(&self, page_size: usize) -> TabScan<'_, Self> {
        TabScan::new(self, page_size)
    }

    /// Lazily enumerate all tabs with the default page size.
    fn list(&self) -> TabScan<'_, Self> {
        TabScan::new(self, DEFAULT_SCAN_PAGE)
    }
}

impl<S: TabStore + ?Sized> StoreExt for S {}

/// Decide whether `new` may replace `stored` under compare-and-set.
pub(crate) fn should_replace(stored: Option<&Tab>, new: &Tab) -> bool {
    match stored {
        Some(current) => new.supersedes(current),
        None => true,
    }
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
