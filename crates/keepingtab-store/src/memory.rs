//! In-memory implementation of the TabStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use keepingtab_core::{ConsumerId, PartitionId, Tab, TabId};

use crate::error::{Result, StoreError};
use crate::traits::{
    now_millis, should_replace, DeadLetter, DeleteOutcome, PutOutcome, SyncCursor, TabStore,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Tabs ordered by id.
    tabs: BTreeMap<TabId, StoredTab>,

    /// Cursors keyed by consumer and partition.
    cursors: HashMap<(ConsumerId, PartitionId), SyncCursor>,

    /// Dead letters keyed by queue position.
    dead_letters: BTreeMap<(PartitionId, u64), DeadLetter>,
}

struct StoredTab {
    tab: Tab,
    tombstoned_at: Option<i64>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TabStore for MemoryStore {
    async fn get(&self, id: &TabId) -> Result<Option<Tab>> {
        let inner = self.read()?;
        Ok(inner.tabs.get(id).map(|st| st.tab.clone()))
    }

    async fn put(&self, tab: &Tab) -> Result<PutOutcome> {
        let mut inner = self.write()?;

        let current = inner.tabs.get(&tab.id).map(|st| &st.tab);
        if !should_replace(current, tab) {
            if let Some(current) = current {
                return Ok(PutOutcome::Conflict {
                    current: current.clone(),
                });
            }
        }

        let tombstoned_at = tab.deleted.then(now_millis);
        inner.tabs.insert(
            tab.id.clone(),
            StoredTab {
                tab: tab.clone(),
                tombstoned_at,
            },
        );

        Ok(PutOutcome::Written)
    }

    async fn delete(&self, id: &TabId) -> Result<DeleteOutcome> {
        let mut inner = self.write()?;
        Ok(match inner.tabs.remove(id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn list_page(&self, after: Option<&TabId>, limit: usize) -> Result<Vec<Tab>> {
        let inner = self.read()?;

        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };

        Ok(inner
            .tabs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, st)| st.tab.clone())
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner.tabs.len() as u64)
    }

    async fn purge_tombstones(&self, before: i64) -> Result<u64> {
        let mut inner = self.write()?;

        let before_len = inner.tabs.len();
        inner.tabs.retain(|_, st| match st.tombstoned_at {
            Some(at) => !(st.tab.deleted && at < before),
            None => true,
        });

        Ok((before_len - inner.tabs.len()) as u64)
    }

    async fn load_cursor(
        &self,
        consumer: &ConsumerId,
        partition: PartitionId,
    ) -> Result<Option<SyncCursor>> {
        let inner = self.read()?;
        Ok(inner.cursors.get(&(consumer.clone(), partition)).cloned())
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .cursors
            .insert((cursor.consumer.clone(), cursor.partition), cursor.clone());
        Ok(())
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<bool> {
        let mut inner = self.write()?;
        let key = (letter.partition, letter.offset);
        if inner.dead_letters.contains_key(&key) {
            return Ok(false);
        }
        inner.dead_letters.insert(key, letter.clone());
        Ok(true)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let inner = self.read()?;
        Ok(inner.dead_letters.values().cloned().collect())
    }
}
