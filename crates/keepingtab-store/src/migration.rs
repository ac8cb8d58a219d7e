//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::traits::now_millis;

/// Current schema version.
pub const CURRENT_VERSION: u32 = 3;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "schema migrated");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        3 => apply_v3(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: tab records.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tabs (
            id TEXT PRIMARY KEY,              -- stable tab identifier
            url TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL DEFAULT '',
            last_modified INTEGER NOT NULL,   -- logical time of last mutation
            deleted INTEGER NOT NULL DEFAULT 0,
            origin TEXT NOT NULL,             -- device of last mutation
            tombstoned_at INTEGER,            -- local Unix ms when deleted became 1
            updated_at INTEGER NOT NULL       -- local Unix ms of last write
        );

        CREATE INDEX IF NOT EXISTS idx_tabs_tombstones ON tabs(deleted, tombstoned_at);
        "#,
    )?;

    Ok(())
}

/// Migration v2: sync bookkeeping.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Consumer offsets into the change queue
        CREATE TABLE sync_cursors (
            consumer TEXT NOT NULL,
            partition_id INTEGER NOT NULL,
            queue_offset INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (consumer, partition_id)
        );

        -- Events that could not be applied
        CREATE TABLE dead_letters (
            partition_id INTEGER NOT NULL,
            queue_offset INTEGER NOT NULL,
            tab_id TEXT NOT NULL,
            origin TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            event BLOB NOT NULL,              -- CBOR encoded change event
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (partition_id, queue_offset)
        );

        CREATE INDEX idx_dead_letters_tab ON dead_letters(tab_id);
        "#,
    )?;

    Ok(())
}

/// Migration v3: per-field versions.
///
/// NULL means the field was written by the row's own version.
fn apply_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE tabs ADD COLUMN url_modified INTEGER;
        ALTER TABLE tabs ADD COLUMN url_deleted INTEGER;
        ALTER TABLE tabs ADD COLUMN url_origin TEXT;
        ALTER TABLE tabs ADD COLUMN title_modified INTEGER;
        ALTER TABLE tabs ADD COLUMN title_deleted INTEGER;
        ALTER TABLE tabs ADD COLUMN title_origin TEXT;
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"tabs".to_string()));
        assert!(tables.contains(&"sync_cursors".to_string()));
        assert!(tables.contains(&"dead_letters".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_upgrades_v2_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        // Roll back to a v2 layout holding one row.
        conn.execute_batch(
            "DROP TABLE tabs;
             DELETE FROM schema_migrations WHERE version = 3;",
        )
        .unwrap();
        apply_v1(&conn).unwrap();
        conn.execute(
            "INSERT INTO tabs (id, url, title, last_modified, deleted, origin, updated_at)
             VALUES ('1', 'u', 't', 5, 0, 'A', 0)",
            [],
        )
        .unwrap();

        migrate(&mut conn).unwrap();

        let url_modified: Option<i64> = conn
            .query_row("SELECT url_modified FROM tabs WHERE id = '1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(url_modified, None);
    }

    #[test]
    fn test_migration_rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (99, 0)",
            [],
        )
        .unwrap();

        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
