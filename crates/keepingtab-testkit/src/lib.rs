//! # KeepingTab Testkit
//!
//! Testing utilities for KeepingTab sync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Scenarios**: merge cases with known outcomes, shared by unit and
//!   integration tests
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: simulated devices that stamp events like real clients
//! - **Fault injection**: a store wrapper that fails, hides or panics on
//!   demand
//!
//! ## Scenarios
//!
//! ```rust
//! use keepingtab_testkit::scenarios::verify_all_scenarios;
//!
//! assert!(verify_all_scenarios().is_empty());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use keepingtab_testkit::generators::{event_from_params, EventParams};
//!
//! proptest! {
//!     #[test]
//!     fn event_is_valid(params: EventParams) {
//!         let event = event_from_params(&params);
//!         prop_assert!(keepingtab_core::validate_event(&event).is_ok());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use keepingtab_testkit::fixtures::TabFixture;
//!
//! let laptop = TabFixture::new("laptop");
//! let open = laptop.upsert("42", "https://example.com", "Example");
//! let close = laptop.delete("42");
//! assert!(open.last_modified() < close.last_modified());
//! ```

pub mod fixtures;
pub mod flaky;
pub mod generators;
pub mod scenarios;

pub use fixtures::{multi_origin_fixtures, replay, TabFixture};
pub use flaky::FlakyStore;
pub use generators::{event_from_params, EventParams};
pub use scenarios::{all_scenarios, check_scenario, verify_all_scenarios, MergeScenario};
