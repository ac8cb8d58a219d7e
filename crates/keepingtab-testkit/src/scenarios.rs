//! Merge scenarios with known outcomes.
//!
//! Each scenario pairs a stored tab (or none) with an incoming event and
//! the decision and resulting stored state every conforming merge must
//! produce. They are checked here against the merge engine and reused by
//! the integration tests against the full sync path.

use keepingtab_core::{apply_event, merge, ChangeEvent, MergeDecision, NoopReason, Tab};

/// A merge scenario.
#[derive(Debug, Clone)]
pub struct MergeScenario {
    /// Human-readable name.
    pub name: &'static str,
    /// Tab already in the store, if any.
    pub stored: Option<Tab>,
    /// The incoming change.
    pub event: ChangeEvent,
    /// Expected merge decision.
    pub expected: MergeDecision,
    /// Expected stored state afterwards.
    pub expected_state: Option<Tab>,
}

/// Get all merge scenarios.
pub fn all_scenarios() -> Vec<MergeScenario> {
    let tied = Tab::new("7", "A", 100)
        .with_url("https://example.com/seven")
        .with_title("Seven");
    let tombstone = Tab::new("7", "A", 100).tombstoned();

    let newer = Tab::new("3", "A", 50)
        .with_url("https://example.com/three")
        .with_title("Three");

    vec![
        MergeScenario {
            name: "delete ties live tab from same origin",
            stored: Some(tied),
            event: ChangeEvent::delete("7", "A", 100, 2),
            expected: MergeDecision::Apply(tombstone.clone()),
            expected_state: Some(tombstone),
        },
        MergeScenario {
            name: "delete of unknown tab",
            stored: None,
            event: ChangeEvent::delete("9", "A", 10, 1),
            expected: MergeDecision::Noop(NoopReason::UnknownTab),
            expected_state: None,
        },
        MergeScenario {
            name: "stale upsert",
            stored: Some(newer.clone()),
            event: ChangeEvent::upsert(
                Tab::new("3", "A", 40).with_url("https://example.com/old"),
                1,
            ),
            expected: MergeDecision::Noop(NoopReason::Stale),
            expected_state: Some(newer),
        },
    ]
}

/// Check one scenario against the merge engine.
///
/// Returns a description of the first mismatch.
pub fn check_scenario(scenario: &MergeScenario) -> Result<(), String> {
    let decision = merge(scenario.stored.as_ref(), &scenario.event)
        .map_err(|e| format!("{}: rejected: {e}", scenario.name))?;
    if decision != scenario.expected {
        return Err(format!(
            "{}: decision {:?}, expected {:?}",
            scenario.name, decision, scenario.expected
        ));
    }

    let state = apply_event(scenario.stored.clone(), &scenario.event)
        .map_err(|e| format!("{}: rejected: {e}", scenario.name))?;
    if state != scenario.expected_state {
        return Err(format!(
            "{}: state {:?}, expected {:?}",
            scenario.name, state, scenario.expected_state
        ));
    }
    Ok(())
}

/// Check every scenario. Returns the mismatches.
pub fn verify_all_scenarios() -> Vec<String> {
    all_scenarios()
        .iter()
        .filter_map(|s| check_scenario(s).err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_hold() {
        let failures = verify_all_scenarios();
        assert!(failures.is_empty(), "{failures:#?}");
    }

    #[test]
    fn test_scenarios_replay_cleanly() {
        for scenario in all_scenarios() {
            let once = apply_event(scenario.stored.clone(), &scenario.event).unwrap();
            let twice = apply_event(once.clone(), &scenario.event).unwrap();
            assert_eq!(once, twice, "{}", scenario.name);
        }
    }

    #[test]
    fn test_tie_delete_wins_either_order() {
        let scenario = &all_scenarios()[0];
        let stored = scenario.stored.clone().unwrap();
        let upsert = ChangeEvent::upsert(stored, 1);

        let delete_last = apply_event(apply_event(None, &upsert).unwrap(), &scenario.event).unwrap();
        let upsert_last = apply_event(delete_last.clone(), &upsert).unwrap();
        assert!(delete_last.unwrap().deleted);
        assert!(upsert_last.unwrap().deleted);
    }
}
