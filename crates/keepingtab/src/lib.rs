//! # KeepingTab
//!
//! Keeps a local tab database in step with changes streamed from every
//! device of a user.
//!
//! ## Overview
//!
//! Devices publish tab changes to a partitioned change queue. This service
//! consumes them, resolves concurrent edits and persists the result:
//!
//! - **Merge**: last-writer-wins on `(last_modified, origin)`, with deletes
//!   winning exact timestamp ties
//! - **Delivery**: at-least-once; a durable cursor per partition means a
//!   crash replays rather than loses changes
//! - **Failures**: transient errors are retried with backoff, events that
//!   cannot be applied are dead-lettered, storage corruption stops the
//!   service
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keepingtab::{telemetry, ServiceConfig, SyncService};
//! use keepingtab::sync::MemoryBroker;
//!
//! async fn example() -> keepingtab::Result<()> {
//!     telemetry::init_tracing(telemetry::DEFAULT_FILTER)?;
//!
//!     let config = ServiceConfig::from_env()?;
//!     let broker = Arc::new(MemoryBroker::new(config.partition_count, config.queue_config()));
//!
//!     let service = SyncService::open(config).await?;
//!     let report = service
//!         .run_until(broker, tokio::time::sleep(std::time::Duration::from_secs(60)))
//!         .await?;
//!
//!     println!("applied {} changes", report.pool.totals().applied);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `keepingtab::core` - Tabs, change events and the merge engine
//! - `keepingtab::store` - Storage abstraction and SQLite
//! - `keepingtab::sync` - Queue consumer, coordinator and worker pool

pub mod config;
pub mod error;
pub mod service;
pub mod telemetry;

// Re-export component crates
pub use keepingtab_core as core;
pub use keepingtab_store as store;
pub use keepingtab_sync as sync;

pub use config::ServiceConfig;
pub use error::{ConfigError, Result, ServiceError};
pub use service::{RunningService, ServiceReport, SyncService};

// Re-export commonly used core types
pub use keepingtab_core::{ChangeEvent, MergeDecision, OriginId, Tab, TabId};
