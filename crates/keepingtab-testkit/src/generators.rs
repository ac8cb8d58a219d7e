//! Proptest generators for property-based testing.

use std::collections::HashMap;

use proptest::prelude::*;

use keepingtab_core::{ChangeEvent, OriginId, Tab, TabDiff, TabId};

/// Generate a tab id.
pub fn tab_id() -> impl Strategy<Value = TabId> {
    "[a-z0-9]{1,16}".prop_map(TabId::new)
}

/// Generate an origin (device id).
pub fn origin() -> impl Strategy<Value = OriginId> {
    "[a-z][a-z0-9-]{0,15}".prop_map(OriginId::new)
}

/// Generate a url.
pub fn url() -> impl Strategy<Value = String> {
    "https://[a-z]{1,12}\\.(com|org|dev)/[a-z0-9/]{0,24}".prop_map(String::from)
}

/// Generate a tab title.
pub fn title() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 ]{0,40}".prop_map(String::from)
}

/// Generate a valid (non-zero) logical time.
pub fn logical_time() -> impl Strategy<Value = u64> {
    1u64..=1_000_000
}

/// Generate a live tab.
pub fn tab() -> impl Strategy<Value = Tab> {
    (tab_id(), origin(), logical_time(), url(), title()).prop_map(|(id, origin, ts, url, title)| {
        Tab::new(id, origin, ts).with_url(url).with_title(title)
    })
}

/// Parameters for generating a change event.
#[derive(Debug, Clone)]
pub struct EventParams {
    pub tab_id: TabId,
    pub origin: OriginId,
    pub last_modified: u64,
    pub sequence: u64,
    pub delete: bool,
    pub diff: bool,
    pub url: Option<String>,
    pub title: Option<String>,
}

impl Arbitrary for EventParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            tab_id(),
            origin(),
            logical_time(),
            1u64..=1000u64, // sequence
            any::<bool>(),  // delete
            any::<bool>(),  // diff
            proptest::option::of(url()),
            proptest::option::of(title()),
        )
            .prop_map(
                |(tab_id, origin, last_modified, sequence, delete, diff, url, title)| EventParams {
                    tab_id,
                    origin,
                    last_modified,
                    sequence,
                    delete,
                    diff,
                    url,
                    title,
                },
            )
            .boxed()
    }
}

/// Build a structurally valid event from parameters.
pub fn event_from_params(params: &EventParams) -> ChangeEvent {
    if params.delete {
        return ChangeEvent::delete(
            params.tab_id.clone(),
            params.origin.clone(),
            params.last_modified,
            params.sequence,
        );
    }

    if params.diff {
        let mut diff = TabDiff::at(params.last_modified);
        diff.url = params.url.clone();
        diff.title = params.title.clone();
        return ChangeEvent::upsert_diff(
            params.tab_id.clone(),
            params.origin.clone(),
            diff,
            params.sequence,
        );
    }

    let tab = Tab::new(
        params.tab_id.clone(),
        params.origin.clone(),
        params.last_modified,
    )
    .with_url(params.url.clone().unwrap_or_default())
    .with_title(params.title.clone().unwrap_or_default());
    ChangeEvent::upsert(tab, params.sequence)
}

/// Generate a structurally valid change event.
pub fn change_event() -> impl Strategy<Value = ChangeEvent> {
    any::<EventParams>().prop_map(|params| event_from_params(&params))
}

/// Ids used by [`event_history`]. Small on purpose, so events collide.
pub const HISTORY_TAB_IDS: [&str; 3] = ["t1", "t2", "t3"];

const HISTORY_ORIGINS: [&str; 3] = ["laptop", "phone", "tablet"];

/// Generate a multi-device history of snapshot upserts, single-field diffs
/// and deletes.
///
/// Every event targets one of [`HISTORY_TAB_IDS`]. Each origin stamps its
/// events with strictly increasing times and sequences, as a real device
/// does; different origins freely tie on time. No two events share a
/// merge key, so the resolved state does not depend on delivery order as
/// long as every targeted tab already exists (see [`history_base`]).
pub fn event_history(max_len: usize) -> impl Strategy<Value = Vec<ChangeEvent>> {
    prop::collection::vec(
        (
            0..HISTORY_TAB_IDS.len(),
            0..HISTORY_ORIGINS.len(),
            1u64..=20,
            0u8..4,
            url(),
            title(),
        ),
        0..=max_len,
    )
    .prop_map(|raw| {
        let mut clocks: HashMap<usize, (u64, u64)> = HashMap::new();
        raw.into_iter()
            .map(|(id, origin, ts, kind, url, title)| {
                let (clock, seq) = clocks.entry(origin).or_insert((0, 0));
                *clock = ts.max(*clock + 1);
                *seq += 1;

                let tab_id = HISTORY_TAB_IDS[id];
                let origin = HISTORY_ORIGINS[origin];
                match kind {
                    0 => ChangeEvent::delete(tab_id, origin, *clock, *seq),
                    1 => ChangeEvent::upsert(
                        Tab::new(tab_id, origin, *clock).with_url(url).with_title(title),
                        *seq,
                    ),
                    2 => ChangeEvent::upsert_diff(tab_id, origin, TabDiff::at(*clock).url(url), *seq),
                    _ => ChangeEvent::upsert_diff(
                        tab_id,
                        origin,
                        TabDiff::at(*clock).title(title),
                        *seq,
                    ),
                }
            })
            .collect()
    })
}

/// Base tabs for [`event_history`]: every id, live, older than any event.
pub fn history_base() -> Vec<Tab> {
    HISTORY_TAB_IDS
        .iter()
        .map(|id| {
            Tab::new(*id, "seed", 0)
                .with_url(format!("https://seed/{id}"))
                .with_title(format!("seed {id}"))
        })
        .collect()
}

/// Generate a history together with a shuffled copy of itself.
pub fn history_and_permutation(
    max_len: usize,
) -> impl Strategy<Value = (Vec<ChangeEvent>, Vec<ChangeEvent>)> {
    event_history(max_len).prop_flat_map(|history| {
        let shuffled = Just(history.clone()).prop_shuffle();
        (Just(history), shuffled)
    })
}
