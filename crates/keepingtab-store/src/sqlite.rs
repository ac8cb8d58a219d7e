//! SQLite implementation of the TabStore trait.
//!
//! This is the primary storage backend for KeepingTab. It uses rusqlite
//! with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use keepingtab_core::{
    ConsumerId, FieldVersions, LogicalTime, MergeKey, OriginId, PartitionId, Tab, TabId,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    now_millis, should_replace, DeadLetter, DeleteOutcome, PutOutcome, SyncCursor, TabStore,
};

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the parent directory and the file if they don't exist, enables
    /// WAL journaling and runs migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        migration::migrate(&mut conn)?;

        tracing::debug!(path = %path.display(), "opened sqlite store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection in the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(format!("connection mutex: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{} {}", what, value)))
}

fn from_i64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("negative {} {}", what, value)))
}

struct TabRow {
    id: String,
    url: String,
    title: String,
    last_modified: i64,
    deleted: bool,
    origin: String,
    url_version: VersionColumns,
    title_version: VersionColumns,
}

impl TabRow {
    const COLUMNS: &'static str = "id, url, title, last_modified, deleted, origin, \
        url_modified, url_deleted, url_origin, title_modified, title_deleted, title_origin";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            last_modified: row.get(3)?,
            deleted: row.get(4)?,
            origin: row.get(5)?,
            url_version: VersionColumns::from_row(row, 6)?,
            title_version: VersionColumns::from_row(row, 9)?,
        })
    }

    fn into_tab(self) -> Result<Tab> {
        Ok(Tab {
            id: TabId::new(self.id),
            url: self.url,
            title: self.title,
            last_modified: LogicalTime(from_i64(self.last_modified, "last_modified")?),
            deleted: self.deleted,
            origin: OriginId::new(self.origin),
            fields: FieldVersions {
                url: self.url_version.into_key("url")?,
                title: self.title_version.into_key("title")?,
            },
        })
    }
}

/// A field version as three nullable columns.
#[derive(Default)]
struct VersionColumns {
    modified: Option<i64>,
    deleted: Option<bool>,
    origin: Option<String>,
}

impl VersionColumns {
    fn from_key(key: Option<&MergeKey>) -> Result<Self> {
        let Some(key) = key else {
            return Ok(Self::default());
        };
        Ok(Self {
            modified: Some(to_i64(key.last_modified.get(), "field version")?),
            deleted: Some(key.is_delete),
            origin: Some(key.origin.as_str().to_owned()),
        })
    }

    fn from_row(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            modified: row.get(first)?,
            deleted: row.get(first + 1)?,
            origin: row.get(first + 2)?,
        })
    }

    fn into_key(self, field: &str) -> Result<Option<MergeKey>> {
        match (self.modified, self.deleted, self.origin) {
            (None, None, None) => Ok(None),
            (Some(modified), Some(is_delete), Some(origin)) => Ok(Some(MergeKey {
                last_modified: LogicalTime(from_i64(modified, "field version")?),
                is_delete,
                origin: OriginId::new(origin),
            })),
            _ => Err(StoreError::InvalidData(format!(
                "partial {} version columns",
                field
            ))),
        }
    }
}

fn read_tab(conn: &Connection, id: &str) -> Result<Option<Tab>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tabs WHERE id = ?1", TabRow::COLUMNS),
            params![id],
            TabRow::from_row,
        )
        .optional()?;

    row.map(TabRow::into_tab).transpose()
}

struct DeadLetterRow {
    partition: u32,
    offset: i64,
    tab_id: String,
    origin: String,
    sequence: i64,
    reason: String,
    attempts: u32,
    event: Vec<u8>,
    recorded_at: i64,
}

impl DeadLetterRow {
    fn into_letter(self) -> Result<DeadLetter> {
        Ok(DeadLetter {
            partition: PartitionId(self.partition),
            offset: from_i64(self.offset, "queue offset")?,
            tab_id: TabId::new(self.tab_id),
            origin: OriginId::new(self.origin),
            sequence: from_i64(self.sequence, "sequence")?,
            reason: self.reason,
            attempts: self.attempts,
            event: self.event,
            recorded_at: self.recorded_at,
        })
    }
}

#[async_trait]
impl TabStore for SqliteStore {
    async fn get(&self, id: &TabId) -> Result<Option<Tab>> {
        let id = id.clone();
        self.run(move |conn| read_tab(conn, id.as_str())).await
    }

    async fn put(&self, tab: &Tab) -> Result<PutOutcome> {
        let tab = tab.clone();

        self.run(move |conn| {
            let last_modified = to_i64(tab.last_modified.get(), "last_modified")?;
            let now = now_millis();

            // Immediate so the read and the write see the same row.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = read_tab(&tx, tab.id.as_str())?;
            if !should_replace(current.as_ref(), &tab) {
                if let Some(current) = current {
                    return Ok(PutOutcome::Conflict { current });
                }
            }

            let tombstoned_at = tab.deleted.then_some(now);
            let url_version = VersionColumns::from_key(tab.fields.url.as_ref())?;
            let title_version = VersionColumns::from_key(tab.fields.title.as_ref())?;
            tx.execute(
                "INSERT INTO tabs (id, url, title, last_modified, deleted, origin, tombstoned_at, updated_at,
                                   url_modified, url_deleted, url_origin,
                                   title_modified, title_deleted, title_origin)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    url = excluded.url,
                    title = excluded.title,
                    last_modified = excluded.last_modified,
                    deleted = excluded.deleted,
                    origin = excluded.origin,
                    tombstoned_at = excluded.tombstoned_at,
                    updated_at = excluded.updated_at,
                    url_modified = excluded.url_modified,
                    url_deleted = excluded.url_deleted,
                    url_origin = excluded.url_origin,
                    title_modified = excluded.title_modified,
                    title_deleted = excluded.title_deleted,
                    title_origin = excluded.title_origin",
                params![
                    tab.id.as_str(),
                    tab.url,
                    tab.title,
                    last_modified,
                    tab.deleted,
                    tab.origin.as_str(),
                    tombstoned_at,
                    now,
                    url_version.modified,
                    url_version.deleted,
                    url_version.origin,
                    title_version.modified,
                    title_version.deleted,
                    title_version.origin,
                ],
            )?;
            tx.commit()?;

            Ok(PutOutcome::Written)
        })
        .await
    }

    async fn delete(&self, id: &TabId) -> Result<DeleteOutcome> {
        let id = id.clone();

        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM tabs WHERE id = ?1", params![id.as_str()])?;
            Ok(if removed > 0 {
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::NotFound
            })
        })
        .await
    }

    async fn list_page(&self, after: Option<&TabId>, limit: usize) -> Result<Vec<Tab>> {
        let after = after.map(|id| id.as_str().to_owned());
        let limit = to_i64(limit as u64, "page limit")?;

        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tabs
                 WHERE (?1 IS NULL OR id > ?1)
                 ORDER BY id
                 LIMIT ?2",
                TabRow::COLUMNS
            ))?;

            let rows = stmt
                .query_map(params![after, limit], TabRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(TabRow::into_tab).collect()
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tabs", [], |row| row.get(0))?;
            from_i64(count, "row count")
        })
        .await
    }

    async fn purge_tombstones(&self, before: i64) -> Result<u64> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM tabs WHERE deleted = 1 AND tombstoned_at < ?1",
                params![before],
            )?;
            Ok(removed as u64)
        })
        .await
    }

    async fn load_cursor(
        &self,
        consumer: &ConsumerId,
        partition: PartitionId,
    ) -> Result<Option<SyncCursor>> {
        let consumer = consumer.clone();

        self.run(move |conn| {
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT queue_offset, updated_at FROM sync_cursors
                     WHERE consumer = ?1 AND partition_id = ?2",
                    params![consumer.as_str(), partition.get()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            row.map(|(offset, updated_at)| {
                Ok(SyncCursor {
                    consumer,
                    partition,
                    offset: from_i64(offset, "queue offset")?,
                    updated_at,
                })
            })
            .transpose()
        })
        .await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let cursor = cursor.clone();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sync_cursors (consumer, partition_id, queue_offset, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(consumer, partition_id) DO UPDATE SET
                    queue_offset = excluded.queue_offset,
                    updated_at = excluded.updated_at",
                params![
                    cursor.consumer.as_str(),
                    cursor.partition.get(),
                    to_i64(cursor.offset, "queue offset")?,
                    cursor.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<bool> {
        let letter = letter.clone();

        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO dead_letters
                    (partition_id, queue_offset, tab_id, origin, sequence, reason, attempts, event, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    letter.partition.get(),
                    to_i64(letter.offset, "queue offset")?,
                    letter.tab_id.as_str(),
                    letter.origin.as_str(),
                    to_i64(letter.sequence, "sequence")?,
                    letter.reason,
                    letter.attempts,
                    letter.event,
                    letter.recorded_at,
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT partition_id, queue_offset, tab_id, origin, sequence, reason, attempts, event, recorded_at
                 FROM dead_letters
                 ORDER BY partition_id, queue_offset",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(DeadLetterRow {
                        partition: row.get(0)?,
                        offset: row.get(1)?,
                        tab_id: row.get(2)?,
                        origin: row.get(3)?,
                        sequence: row.get(4)?,
                        reason: row.get(5)?,
                        attempts: row.get(6)?,
                        event: row.get(7)?,
                        recorded_at: row.get(8)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(DeadLetterRow::into_letter).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;

    fn tab(id: &str, origin: &str, ts: u64) -> Tab {
        Tab::new(id, origin, ts)
            .with_url(format!("https://example.com/{id}"))
            .with_title(format!("Tab {id}"))
    }

    fn letter(partition: u32, offset: u64) -> DeadLetter {
        DeadLetter {
            partition: PartitionId(partition),
            offset,
            tab_id: TabId::from("9"),
            origin: OriginId::from("A"),
            sequence: 3,
            reason: "missing timestamp".into(),
            attempts: 1,
            event: vec![0xa0],
            recorded_at: 1,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_tab() {
        let store = SqliteStore::open_memory().unwrap();
        let t = tab("1", "A", 10);

        assert_eq!(store.put(&t).await.unwrap(), PutOutcome::Written);
        assert_eq!(store.get(&t.id).await.unwrap(), Some(t));
        assert_eq!(store.get(&TabId::from("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_conflict_returns_current() {
        let store = SqliteStore::open_memory().unwrap();
        let newer = tab("1", "A", 10);
        store.put(&newer).await.unwrap();

        let outcome = store.put(&tab("1", "B", 5)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Conflict { current: newer.clone() });

        // A newer version replaces it.
        let newest = tab("1", "B", 11);
        assert_eq!(store.put(&newest).await.unwrap(), PutOutcome::Written);
        assert_eq!(store.get(&newest.id).await.unwrap(), Some(newest));
    }

    #[tokio::test]
    async fn test_field_versions_round_trip() {
        let store = SqliteStore::open_memory().unwrap();
        let mut t = tab("1", "B", 6);
        t.fields.title = Some(Tab::new("1", "A", 5).merge_key());
        t.fields.url = Some(MergeKey::unset());
        store.put(&t).await.unwrap();
        assert_eq!(store.get(&t.id).await.unwrap(), Some(t.clone()));

        // Same record version, newer title: still a newer state.
        let mut newer = t.clone();
        newer.title = "renamed".into();
        newer.fields.title = Some(Tab::new("1", "C", 5).merge_key());
        assert_eq!(store.put(&newer).await.unwrap(), PutOutcome::Written);
        assert_eq!(
            store.put(&t).await.unwrap(),
            PutOutcome::Conflict { current: newer }
        );
    }

    #[tokio::test]
    async fn test_tombstone_survives_and_purges() {
        let store = SqliteStore::open_memory().unwrap();
        let tombstone = Tab::new("1", "A", 10).tombstoned();
        store.put(&tombstone).await.unwrap();

        let stored = store.get(&tombstone.id).await.unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(store.count().await.unwrap(), 1);

        assert_eq!(store.purge_tombstones(0).await.unwrap(), 0);
        assert_eq!(store.purge_tombstones(now_millis() + 1).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_page_orders_by_id() {
        let store = SqliteStore::open_memory().unwrap();
        for id in ["c", "a", "d", "b"] {
            store.put(&tab(id, "A", 1)).await.unwrap();
        }

        let first = store.list_page(None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let rest = store.list_page(Some(&TabId::from("b")), 10).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);

        assert_eq!(store.list().collect_all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_timestamp() {
        let store = SqliteStore::open_memory().unwrap();
        let t = Tab::new("1", "A", u64::MAX);

        assert!(matches!(
            store.put(&t).await,
            Err(StoreError::OutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_cursor_upsert() {
        let store = SqliteStore::open_memory().unwrap();
        let consumer = ConsumerId::new("c1");

        for offset in [3, 7] {
            store
                .save_cursor(&SyncCursor {
                    consumer: consumer.clone(),
                    partition: PartitionId(2),
                    offset,
                    updated_at: offset as i64,
                })
                .await
                .unwrap();
        }

        let cursor = store
            .load_cursor(&consumer, PartitionId(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.offset, 7);
        assert!(store
            .load_cursor(&consumer, PartitionId(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dead_letters_are_idempotent() {
        let store = SqliteStore::open_memory().unwrap();

        assert!(store.record_dead_letter(&letter(1, 5)).await.unwrap());
        assert!(!store.record_dead_letter(&letter(1, 5)).await.unwrap());
        assert!(store.record_dead_letter(&letter(0, 9)).await.unwrap());

        let letters = store.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0], letter(0, 9));
        assert_eq!(letters[1].offset, 5);
    }

    #[tokio::test]
    async fn test_reopen_keeps_tabs_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("keepingtab.db");
        let consumer = ConsumerId::new("c1");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&tab("1", "A", 10)).await.unwrap();
            store
                .save_cursor(&SyncCursor {
                    consumer: consumer.clone(),
                    partition: PartitionId(0),
                    offset: 12,
                    updated_at: 1,
                })
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(
            store.get(&TabId::from("1")).await.unwrap(),
            Some(tab("1", "A", 10))
        );
        let cursor = store.load_cursor(&consumer, PartitionId(0)).await.unwrap();
        assert_eq!(cursor.map(|c| c.offset), Some(12));
    }
}
