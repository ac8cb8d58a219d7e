//! Fault-injecting store wrapper.
//!
//! [`FlakyStore`] delegates to an inner [`TabStore`] and fails, hides or
//! panics on demand. Fault counters count down per call; `u32::MAX` means
//! "forever".

use std::sync::Mutex;

use async_trait::async_trait;

use keepingtab_core::{ConsumerId, PartitionId, Tab, TabId};
use keepingtab_store::{
    DeadLetter, DeleteOutcome, PutOutcome, Result, StoreError, SyncCursor, TabStore,
};

#[derive(Debug, Default)]
struct Faults {
    fail_puts: u32,
    fail_gets: u32,
    hide_gets: u32,
    panic_puts: u32,
    fail_cursor_saves: u32,
    corrupt: bool,
    put_attempts: u64,
}

/// Consume one unit of a fault counter.
fn take(counter: &mut u32) -> bool {
    match *counter {
        0 => false,
        u32::MAX => true,
        _ => {
            *counter -= 1;
            true
        }
    }
}

/// A [`TabStore`] that misbehaves on request.
#[derive(Debug, Default)]
pub struct FlakyStore<S> {
    inner: S,
    faults: Mutex<Faults>,
}

impl<S: TabStore> FlakyStore<S> {
    /// Wrap a store. No faults are armed.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// The wrapped store, bypassing fault injection.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next `n` puts with a transient error.
    pub fn fail_puts(&self, n: u32) {
        self.with_faults(|f| f.fail_puts = n);
    }

    /// Fail the next `n` gets with a transient error.
    pub fn fail_gets(&self, n: u32) {
        self.with_faults(|f| f.fail_gets = n);
    }

    /// Make the next `n` gets report the tab as absent.
    ///
    /// Simulates a concurrent writer landing between read and write, so the
    /// following put sees a conflict.
    pub fn hide_gets(&self, n: u32) {
        self.with_faults(|f| f.hide_gets = n);
    }

    /// Panic inside the next `n` puts.
    pub fn panic_on_put(&self, n: u32) {
        self.with_faults(|f| f.panic_puts = n);
    }

    /// Fail the next `n` cursor saves with a transient error.
    pub fn fail_cursor_saves(&self, n: u32) {
        self.with_faults(|f| f.fail_cursor_saves = n);
    }

    /// Make every subsequent operation fail fatally.
    pub fn corrupt(&self) {
        self.with_faults(|f| f.corrupt = true);
    }

    /// Clear all armed faults.
    pub fn heal(&self) {
        self.with_faults(|f| {
            let attempts = f.put_attempts;
            *f = Faults {
                put_attempts: attempts,
                ..Faults::default()
            };
        });
    }

    /// Number of puts attempted through this wrapper, failed ones included.
    pub fn put_attempts(&self) -> u64 {
        self.faults.lock().map(|f| f.put_attempts).unwrap_or(0)
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut Faults) -> T) -> T {
        let mut guard = match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn check(&self, pick: impl FnOnce(&mut Faults) -> bool, op: &str) -> Result<()> {
        self.with_faults(|f| {
            if f.corrupt {
                return Err(StoreError::InvalidData(format!("injected corruption ({op})")));
            }
            if pick(f) {
                return Err(StoreError::Unavailable(format!("injected fault ({op})")));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl<S: TabStore> TabStore for FlakyStore<S> {
    async fn get(&self, id: &TabId) -> Result<Option<Tab>> {
        self.check(|f| take(&mut f.fail_gets), "get")?;
        if self.with_faults(|f| take(&mut f.hide_gets)) {
            return Ok(None);
        }
        self.inner.get(id).await
    }

    async fn put(&self, tab: &Tab) -> Result<PutOutcome> {
        // The guard is released before panicking so the lock stays usable.
        let panic = self.with_faults(|f| {
            f.put_attempts += 1;
            take(&mut f.panic_puts)
        });
        if panic {
            panic!("injected panic on put of tab {}", tab.id);
        }
        self.check(|f| take(&mut f.fail_puts), "put")?;
        self.inner.put(tab).await
    }

    async fn delete(&self, id: &TabId) -> Result<DeleteOutcome> {
        self.check(|_| false, "delete")?;
        self.inner.delete(id).await
    }

    async fn list_page(&self, after: Option<&TabId>, limit: usize) -> Result<Vec<Tab>> {
        self.check(|_| false, "list_page")?;
        self.inner.list_page(after, limit).await
    }

    async fn count(&self) -> Result<u64> {
        self.check(|_| false, "count")?;
        self.inner.count().await
    }

    async fn purge_tombstones(&self, before: i64) -> Result<u64> {
        self.check(|_| false, "purge_tombstones")?;
        self.inner.purge_tombstones(before).await
    }

    async fn load_cursor(
        &self,
        consumer: &ConsumerId,
        partition: PartitionId,
    ) -> Result<Option<SyncCursor>> {
        self.check(|_| false, "load_cursor")?;
        self.inner.load_cursor(consumer, partition).await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.check(|f| take(&mut f.fail_cursor_saves), "save_cursor")?;
        self.inner.save_cursor(cursor).await
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<bool> {
        self.check(|_| false, "record_dead_letter")?;
        self.inner.record_dead_letter(letter).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.check(|_| false, "list_dead_letters")?;
        self.inner.list_dead_letters().await
    }
}
