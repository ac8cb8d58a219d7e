//! Merge engine: last-writer-wins with tombstone priority.
//!
//! Given the stored version of a tab (possibly absent) and an incoming
//! [`ChangeEvent`], decide the resolved state. The decision is a pure
//! function of its inputs, so replaying an event after a crash always yields
//! the same outcome.
//!
//! ## Rules
//!
//! 1. No stored tab: an upsert becomes the stored tab; a delete is a no-op.
//! 2. Stored tab exists: the change applies only if its version is strictly
//!    greater than the stored version, otherwise it is discarded as stale.
//! 3. Versions are compared with [`MergeKey`]: `last_modified`, then deletes
//!    above upserts, then `origin`. A delete therefore wins an exact
//!    timestamp tie against an upsert regardless of arrival order.
//!
//! Rule 2 is applied per field. A snapshot writes url and title, a diff
//! writes the fields it carries and a delete clears both. Each field keeps
//! the greatest version that wrote it, and the tab's own version is the
//! greatest change seen. With snapshots only every field carries the tab's
//! version and this reduces to whole-record last-writer-wins; with diffs it
//! keeps merging order independent.

use crate::error::ValidationError;
use crate::event::{ChangeEvent, ChangePayload, Operation};
use crate::tab::{FieldVersions, MergeKey, Tab};
use crate::validation::validate_event;

/// Why a change was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoopReason {
    /// Delete for a tab that was never stored.
    UnknownTab,
    /// The stored version is newer than the change.
    Stale,
    /// The stored version is exactly the version of the change (replay).
    AlreadyApplied,
}

impl NoopReason {
    /// Stable name used in logs and counters.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTab => "unknown_tab",
            Self::Stale => "stale",
            Self::AlreadyApplied => "already_applied",
        }
    }
}

/// Outcome of merging one event against the stored tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Write this tab.
    Apply(Tab),
    /// Leave the store unchanged.
    Noop(NoopReason),
}

impl MergeDecision {
    /// Check if the decision writes to the store.
    pub fn is_apply(&self) -> bool {
        matches!(self, MergeDecision::Apply(_))
    }

    /// The tab to write, if any.
    pub fn into_tab(self) -> Option<Tab> {
        match self {
            MergeDecision::Apply(tab) => Some(tab),
            MergeDecision::Noop(_) => None,
        }
    }
}

/// Decide the resolved state of a tab.
///
/// Returns a [`ValidationError`] for malformed events, or when `stored`
/// belongs to a different tab than the event.
pub fn merge(stored: Option<&Tab>, event: &ChangeEvent) -> Result<MergeDecision, ValidationError> {
    validate_event(event)?;

    let incoming = event
        .merge_key()
        .ok_or_else(|| ValidationError::MissingTimestamp(event.tab_id.clone()))?;

    let stored = match stored {
        Some(tab) => tab,
        None => {
            return Ok(match event.operation {
                Operation::Delete => MergeDecision::Noop(NoopReason::UnknownTab),
                Operation::Upsert => {
                    let blank = Tab::new(event.tab_id.clone(), "", 0);
                    MergeDecision::Apply(resolve(&blank, event, &incoming))
                }
            });
        }
    };

    if stored.id != event.tab_id {
        return Err(ValidationError::StructuralError(format!(
            "stored tab {} does not match event tab {}",
            stored.id, event.tab_id
        )));
    }

    let resolved = resolve(stored, event, &incoming);
    if resolved.supersedes(stored) {
        Ok(MergeDecision::Apply(resolved))
    } else if stored.merge_key() == incoming
        || stored.url_version() == incoming
        || stored.title_version() == incoming
    {
        Ok(MergeDecision::Noop(NoopReason::AlreadyApplied))
    } else {
        Ok(MergeDecision::Noop(NoopReason::Stale))
    }
}

/// Apply an event to an optional stored tab and return the new stored state.
///
/// Convenience fold over [`merge`], used to replay event sequences.
pub fn apply_event(stored: Option<Tab>, event: &ChangeEvent) -> Result<Option<Tab>, ValidationError> {
    match merge(stored.as_ref(), event)? {
        MergeDecision::Apply(tab) => Ok(Some(tab)),
        MergeDecision::Noop(_) => Ok(stored),
    }
}

/// Merge a valid event with version `incoming` into `stored`.
///
/// A brand new tab is merged into a blank tab whose versions are all
/// [`MergeKey::unset`].
fn resolve(stored: &Tab, event: &ChangeEvent, incoming: &MergeKey) -> Tab {
    let (url, title) = match (&event.operation, &event.payload) {
        (Operation::Upsert, ChangePayload::Snapshot(snapshot)) => {
            (Some(snapshot.url.as_str()), Some(snapshot.title.as_str()))
        }
        (Operation::Upsert, ChangePayload::Diff(diff)) => (diff.url.as_deref(), diff.title.as_deref()),
        // Tombstones carry no content, so concurrent deletes converge
        // regardless of what they overwrote.
        (Operation::Delete, _) => (Some(""), Some("")),
    };

    let (url, url_version) = write_field(&stored.url, stored.url_version(), url, incoming);
    let (title, title_version) =
        write_field(&stored.title, stored.title_version(), title, incoming);
    let version = stored.merge_key().max(incoming.clone());

    Tab {
        id: event.tab_id.clone(),
        url,
        title,
        last_modified: version.last_modified,
        deleted: version.is_delete,
        fields: FieldVersions {
            url: (url_version != version).then_some(url_version),
            title: (title_version != version).then_some(title_version),
        },
        origin: version.origin,
    }
}

fn write_field(
    current: &str,
    current_version: MergeKey,
    value: Option<&str>,
    incoming: &MergeKey,
) -> (String, MergeKey) {
    match value {
        Some(value) if *incoming > current_version => (value.to_string(), incoming.clone()),
        _ => (current.to_string(), current_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tab::TabDiff;
    use crate::types::LogicalTime;
    use proptest::prelude::*;

    fn live(id: &str, origin: &str, ts: u64) -> Tab {
        Tab::new(id, origin, ts)
            .with_url(format!("https://{origin}.example/{ts}"))
            .with_title(format!("{origin}@{ts}"))
    }

    #[test]
    fn test_upsert_creates_unknown_tab() {
        let event = ChangeEvent::upsert(live("9", "A", 5), 1);
        let decision = merge(None, &event).unwrap();
        assert_eq!(decision, MergeDecision::Apply(live("9", "A", 5)));
    }

    #[test]
    fn test_delete_of_unknown_tab_is_noop() {
        let event = ChangeEvent::delete("9", "A", 5, 1);
        let decision = merge(None, &event).unwrap();
        assert_eq!(decision, MergeDecision::Noop(NoopReason::UnknownTab));
    }

    #[test]
    fn test_delete_wins_tie_same_origin() {
        let stored = live("7", "A", 100);
        let event = ChangeEvent::delete("7", "A", 100, 2);

        let tab = merge(Some(&stored), &event).unwrap().into_tab().unwrap();
        assert!(tab.deleted);
        assert_eq!(tab.id.as_str(), "7");
        assert_eq!(tab.last_modified, LogicalTime(100));
        assert!(tab.url.is_empty());
    }

    #[test]
    fn test_delete_wins_tie_lower_origin() {
        let stored = live("7", "B", 100);
        let event = ChangeEvent::delete("7", "A", 100, 2);
        let tab = merge(Some(&stored), &event).unwrap().into_tab().unwrap();
        assert!(tab.deleted);
        assert_eq!(tab.origin.as_str(), "A");
    }

    #[test]
    fn test_upsert_does_not_resurrect_on_tie() {
        let stored = live("7", "A", 100).tombstoned();
        let event = ChangeEvent::upsert(live("7", "Z", 100), 3);
        let decision = merge(Some(&stored), &event).unwrap();
        assert_eq!(decision, MergeDecision::Noop(NoopReason::Stale));
    }

    #[test]
    fn test_newer_upsert_resurrects_tombstone() {
        let stored = live("7", "A", 100).tombstoned();
        let event = ChangeEvent::upsert(live("7", "A", 101), 3);
        let tab = merge(Some(&stored), &event).unwrap().into_tab().unwrap();
        assert!(!tab.deleted);
        assert_eq!(tab.last_modified, LogicalTime(101));
    }

    #[test]
    fn test_stale_upsert_discarded() {
        let stored = live("3", "A", 50);
        let event = ChangeEvent::upsert(live("3", "B", 40), 1);
        let decision = merge(Some(&stored), &event).unwrap();
        assert_eq!(decision, MergeDecision::Noop(NoopReason::Stale));
    }

    #[test]
    fn test_origin_breaks_exact_tie() {
        let stored = live("3", "A", 50);
        let higher = ChangeEvent::upsert(live("3", "B", 50), 1);
        let lower = ChangeEvent::upsert(live("3", "0", 50), 1);

        assert!(merge(Some(&stored), &higher).unwrap().is_apply());
        assert_eq!(
            merge(Some(&stored), &lower).unwrap(),
            MergeDecision::Noop(NoopReason::Stale)
        );
    }

    #[test]
    fn test_replayed_event_is_already_applied() {
        let event = ChangeEvent::upsert(live("1", "A", 10), 1);
        let stored = merge(None, &event).unwrap().into_tab().unwrap();
        assert_eq!(
            merge(Some(&stored), &event).unwrap(),
            MergeDecision::Noop(NoopReason::AlreadyApplied)
        );
    }

    #[test]
    fn test_diff_upsert_overlays_stored() {
        let stored = live("1", "A", 10);
        let event = ChangeEvent::upsert_diff("1", "B", TabDiff::at(11).title("renamed"), 4);
        let tab = merge(Some(&stored), &event).unwrap().into_tab().unwrap();
        assert_eq!(tab.title, "renamed");
        assert_eq!(tab.url, stored.url);
        assert_eq!(tab.origin.as_str(), "B");
        assert_eq!(tab.last_modified, LogicalTime(11));
    }

    #[test]
    fn test_diffs_on_different_fields_commute() {
        let base = Some(Tab::new("t", "seed", 1).with_url("u0").with_title("t0"));
        let rename = ChangeEvent::upsert_diff("t", "A", TabDiff::at(5).title("t-A"), 1);
        let moved = ChangeEvent::upsert_diff("t", "B", TabDiff::at(6).url("u-B"), 1);

        let ab = apply_event(apply_event(base.clone(), &rename).unwrap(), &moved).unwrap();
        let ba = apply_event(apply_event(base, &moved).unwrap(), &rename).unwrap();
        assert_eq!(ab, ba);

        let tab = ab.unwrap();
        assert_eq!(tab.url, "u-B");
        assert_eq!(tab.title, "t-A");
        assert_eq!(tab.last_modified, LogicalTime(6));
        assert_eq!(tab.origin.as_str(), "B");
    }

    #[test]
    fn test_older_diff_still_wins_untouched_field() {
        let stored = Tab::new("t", "seed", 1).with_url("u0").with_title("t0");
        let moved = ChangeEvent::upsert_diff("t", "B", TabDiff::at(6).url("u-B"), 1);
        let stored = merge(Some(&stored), &moved).unwrap().into_tab().unwrap();

        let rename = ChangeEvent::upsert_diff("t", "A", TabDiff::at(5).title("t-A"), 1);
        let tab = merge(Some(&stored), &rename).unwrap().into_tab().unwrap();
        assert_eq!(tab.title, "t-A");
        assert_eq!(tab.last_modified, LogicalTime(6));

        // Replaying it is recognised.
        assert_eq!(
            merge(Some(&tab), &rename).unwrap(),
            MergeDecision::Noop(NoopReason::AlreadyApplied)
        );
        // A change older than every field is stale.
        let older = ChangeEvent::upsert_diff("t", "A", TabDiff::at(2).title("old"), 1);
        assert_eq!(
            merge(Some(&tab), &older).unwrap(),
            MergeDecision::Noop(NoopReason::Stale)
        );
    }

    #[test]
    fn test_diff_after_delete_does_not_revive_old_content() {
        let delete = ChangeEvent::delete("t", "A", 10, 2);
        let stored = merge(Some(&live("t", "A", 9)), &delete)
            .unwrap()
            .into_tab()
            .unwrap();

        let rename = ChangeEvent::upsert_diff("t", "B", TabDiff::at(11).title("back"), 3);
        let tab = merge(Some(&stored), &rename).unwrap().into_tab().unwrap();
        assert!(!tab.deleted);
        assert_eq!(tab.title, "back");
        assert_eq!(tab.url, "");
    }

    #[test]
    fn test_diff_upsert_creates_with_defaults() {
        let event = ChangeEvent::upsert_diff("1", "B", TabDiff::at(3).url("https://x.example"), 1);
        let tab = merge(None, &event).unwrap().into_tab().unwrap();
        assert_eq!(tab.url, "https://x.example");
        assert_eq!(tab.title, "");
        assert!(!tab.deleted);
    }

    #[test]
    fn test_snapshot_with_deleted_flag_upserts_live() {
        let event = ChangeEvent::upsert(live("1", "A", 3).tombstoned(), 1);
        let tab = merge(None, &event).unwrap().into_tab().unwrap();
        assert!(!tab.deleted);
    }

    #[test]
    fn test_malformed_event_rejected() {
        let event = ChangeEvent::delete("", "A", 3, 1);
        assert_eq!(merge(None, &event), Err(ValidationError::MissingTabId));
    }

    #[test]
    fn test_stored_tab_mismatch_rejected() {
        let stored = live("other", "A", 3);
        let event = ChangeEvent::delete("1", "A", 5, 1);
        assert!(matches!(
            merge(Some(&stored), &event),
            Err(ValidationError::StructuralError(_))
        ));
    }

    fn event_strategy() -> impl Strategy<Value = ChangeEvent> {
        (1u64..20, prop::sample::select(vec!["A", "B", "C"]), 0u8..4, 1u64..100).prop_map(
            |(ts, origin, kind, seq)| match kind {
                0 => ChangeEvent::delete("t", origin, ts, seq),
                1 => ChangeEvent::upsert(live("t", origin, ts), seq),
                2 => ChangeEvent::upsert_diff(
                    "t",
                    origin,
                    TabDiff::at(ts).url(format!("https://{origin}.example/{ts}/moved")),
                    seq,
                ),
                _ => ChangeEvent::upsert_diff(
                    "t",
                    origin,
                    TabDiff::at(ts).title(format!("{origin}@{ts} renamed")),
                    seq,
                ),
            },
        )
    }

    fn base_strategy() -> impl Strategy<Value = Option<Tab>> {
        prop_oneof![Just(None), Just(Some(live("t", "base", 0)))]
    }

    proptest! {
        #[test]
        fn prop_merge_idempotent(base in base_strategy(), event in event_strategy()) {
            let once = apply_event(base.clone(), &event).unwrap();
            let twice = apply_event(once.clone(), &event).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_commutative_over_existing_tab(e1 in event_strategy(), e2 in event_strategy()) {
            prop_assume!(e1.merge_key() != e2.merge_key());
            let base = Some(live("t", "base", 0));

            let ab = apply_event(apply_event(base.clone(), &e1).unwrap(), &e2).unwrap();
            let ba = apply_event(apply_event(base, &e2).unwrap(), &e1).unwrap();
            prop_assert_eq!(&ab, &ba);

            let winner = if e1.merge_key() > e2.merge_key() { &e1 } else { &e2 };
            let tab = ab.unwrap();
            prop_assert_eq!(Some(tab.merge_key()), winner.merge_key());
        }

        #[test]
        fn prop_delete_wins_timestamp_tie(ts in 1u64..1000, up_origin in "[a-z]{1,4}", del_origin in "[a-z]{1,4}") {
            let base = Some(live("t", "base", 0));
            let upsert = ChangeEvent::upsert(live("t", &up_origin, ts), 1);
            let delete = ChangeEvent::delete("t", del_origin.as_str(), ts, 1);

            let ab = apply_event(apply_event(base.clone(), &upsert).unwrap(), &delete).unwrap();
            let ba = apply_event(apply_event(base, &delete).unwrap(), &upsert).unwrap();
            prop_assert!(ab.unwrap().deleted);
            prop_assert!(ba.unwrap().deleted);
        }

        #[test]
        fn prop_merge_deterministic(base in base_strategy(), event in event_strategy()) {
            prop_assert_eq!(merge(base.as_ref(), &event), merge(base.as_ref(), &event));
        }
    }
}
