//! # KeepingTab Store
//!
//! Storage abstraction for KeepingTab. Provides a trait-based interface for
//! tab persistence with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The store module abstracts tab storage behind the [`TabStore`] trait,
//! allowing the sync coordinator to be storage-agnostic. The primary
//! implementation is [`SqliteStore`], with [`MemoryStore`] for testing.
//!
//! Besides tabs, the store keeps the bookkeeping that has to survive a
//! restart together with them: consumer cursors and dead letters.
//!
//! ## Key Types
//!
//! - [`TabStore`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`PutOutcome`] - Result of a compare-and-set write
//! - [`TabScan`] - Lazy paged enumeration of all tabs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keepingtab_core::Tab;
//! use keepingtab_store::{PutOutcome, SqliteStore, StoreExt, TabStore};
//!
//! async fn example() -> keepingtab_store::Result<()> {
//!     let store = SqliteStore::open("./data/keepingtab.db")?;
//!
//!     let tab = Tab::new("42", "laptop", 100).with_url("https://example.com");
//!     assert_eq!(store.put(&tab).await?, PutOutcome::Written);
//!
//!     let mut scan = store.list();
//!     while let Some(tab) = scan.next().await? {
//!         println!("{} {}", tab.id, tab.url);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Compare-and-set writes**: `put` only replaces a strictly older version
//! - **Tombstones**: deletes are stored rows until purged after retention
//! - **Idempotent dead letters**: one record per queue position

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    DeadLetter, DeleteOutcome, PutOutcome, StoreExt, SyncCursor, TabScan, TabStore,
    DEFAULT_SCAN_PAGE,
};
