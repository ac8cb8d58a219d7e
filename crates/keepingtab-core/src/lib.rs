//! # KeepingTab Core
//!
//! Pure primitives for KeepingTab sync: tabs, change events, validation and
//! the merge engine.
//!
//! This crate contains no I/O, no storage, no networking. Every function is
//! deterministic over its inputs, which is what makes replaying events after
//! a crash safe.
//!
//! ## Key Types
//!
//! - [`Tab`] - A synchronizable browser-tab record
//! - [`ChangeEvent`] - A single upsert or delete produced by a device
//! - [`MergeKey`] - The total order deciding which version of a tab wins
//! - [`MergeDecision`] - Result of merging an event against the stored tab
//!
//! ## Merge
//!
//! ```rust
//! use keepingtab_core::{merge, ChangeEvent, MergeDecision, Tab};
//!
//! let stored = Tab::new("7", "A", 100);
//! let delete = ChangeEvent::delete("7", "A", 100, 2);
//!
//! // A delete wins an exact timestamp tie.
//! match merge(Some(&stored), &delete).unwrap() {
//!     MergeDecision::Apply(tab) => assert!(tab.deleted),
//!     MergeDecision::Noop(_) => unreachable!(),
//! }
//! ```

pub mod canonical;
pub mod error;
pub mod event;
pub mod merge;
pub mod tab;
pub mod types;
pub mod validation;

pub use canonical::{canonical_tab_bytes, decode_event, encode_event};
pub use error::{CoreError, ValidationError};
pub use event::{ChangeEvent, ChangePayload, Operation};
pub use merge::{apply_event, merge, MergeDecision, NoopReason};
pub use tab::{FieldVersions, MergeKey, Tab, TabDiff};
pub use types::{ConsumerId, LogicalTime, OriginId, PartitionId, TabId};
pub use validation::validate_event;
