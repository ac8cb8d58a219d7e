//! # KeepingTab Sync
//!
//! Consumes tab changes from a partitioned queue and applies them to the
//! local store.
//!
//! ## Overview
//!
//! Each queue partition is driven by one [`Coordinator`]. It receives a
//! [`Delivery`], merges it against the stored tab, writes the result through
//! the store's compare-and-set `put`, and acknowledges it. A [`WorkerPool`]
//! runs one supervised coordinator per partition.
//!
//! ## Key Properties
//!
//! - **At-least-once**: the cursor only passes settled events, so a crash
//!   replays rather than loses
//! - **Idempotent**: replayed events resolve to no-ops
//! - **Order-independent**: any delivery order converges to one state
//! - **Never silent**: events that cannot be applied are dead-lettered
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keepingtab_core::{ChangeEvent, Tab};
//! use keepingtab_store::SqliteStore;
//! use keepingtab_sync::{shutdown, MemoryBroker, QueueConfig, WorkerConfig, WorkerPool};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteStore::open("./data/keepingtab.db")?);
//!     let broker = Arc::new(MemoryBroker::new(4, QueueConfig::default()));
//!
//!     let (trigger, _) = shutdown::channel();
//!     let pool = WorkerPool::new(store, broker.clone(), WorkerConfig::default()).spawn(trigger);
//!
//!     broker.publish(ChangeEvent::upsert(Tab::new("42", "laptop", 1), 1))?;
//!
//!     let report = pool.shutdown().await?;
//!     println!("applied {}", report.totals().applied);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod queue;
pub mod reaper;
pub mod shutdown;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use convergence::{
    compute_store_state_hash, verify_against, verify_convergence, ConvergenceResult, StateHash,
};
pub use coordinator::{Coordinator, CoordinatorConfig, EventState, SyncReport, SyncStats};
pub use error::{QueueError, Result, SyncError};
pub use queue::{
    memory::MemoryBroker, ChangeQueue, Delivery, NackOutcome, NackReason, QueueConfig,
    QueueConnector,
};
pub use reaper::{ReaperConfig, TombstoneReaper};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use worker::{PoolReport, WorkerConfig, WorkerPool, WorkerPoolHandle};

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
