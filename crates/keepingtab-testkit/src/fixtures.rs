//! Test fixtures and helpers.
//!
//! A [`TabFixture`] plays one device: it stamps every event it builds with
//! its origin, a strictly increasing logical clock and the next sequence
//! number, the way a well-behaved client would.

use std::cell::Cell;
use std::collections::BTreeMap;

use keepingtab_core::{apply_event, ChangeEvent, OriginId, Tab, TabDiff, TabId, ValidationError};

/// A simulated device producing change events.
pub struct TabFixture {
    pub origin: OriginId,
    clock: Cell<u64>,
    sequence: Cell<u64>,
}

impl TabFixture {
    /// Create a device with the given origin.
    pub fn new(origin: impl Into<OriginId>) -> Self {
        Self {
            origin: origin.into(),
            clock: Cell::new(0),
            sequence: Cell::new(0),
        }
    }

    /// Start the device clock at `time` (the next event is stamped `time + 1`).
    pub fn starting_at(self, time: u64) -> Self {
        self.clock.set(time);
        self
    }

    /// Current logical clock.
    pub fn clock(&self) -> u64 {
        self.clock.get()
    }

    fn tick(&self) -> u64 {
        let next = self.clock.get() + 1;
        self.clock.set(next);
        next
    }

    fn next_sequence(&self) -> u64 {
        let next = self.sequence.get() + 1;
        self.sequence.set(next);
        next
    }

    /// Upsert a full snapshot at the next tick.
    pub fn upsert(&self, tab_id: &str, url: &str, title: &str) -> ChangeEvent {
        let ts = self.tick();
        self.upsert_at(tab_id, url, title, ts)
    }

    /// Upsert a full snapshot at an explicit logical time.
    ///
    /// The device clock jumps forward if `ts` is ahead of it.
    pub fn upsert_at(&self, tab_id: &str, url: &str, title: &str, ts: u64) -> ChangeEvent {
        self.clock.set(self.clock.get().max(ts));
        let tab = Tab::new(tab_id, self.origin.clone(), ts)
            .with_url(url)
            .with_title(title);
        ChangeEvent::upsert(tab, self.next_sequence())
    }

    /// Upsert a diff touching only the url at the next tick.
    pub fn diff_url(&self, tab_id: &str, url: &str) -> ChangeEvent {
        let diff = TabDiff::at(self.tick()).url(url);
        ChangeEvent::upsert_diff(tab_id, self.origin.clone(), diff, self.next_sequence())
    }

    /// Upsert a diff touching only the title at the next tick.
    pub fn diff_title(&self, tab_id: &str, title: &str) -> ChangeEvent {
        let diff = TabDiff::at(self.tick()).title(title);
        ChangeEvent::upsert_diff(tab_id, self.origin.clone(), diff, self.next_sequence())
    }

    /// Delete at the next tick.
    pub fn delete(&self, tab_id: &str) -> ChangeEvent {
        let ts = self.tick();
        self.delete_at(tab_id, ts)
    }

    /// Delete at an explicit logical time.
    pub fn delete_at(&self, tab_id: &str, ts: u64) -> ChangeEvent {
        self.clock.set(self.clock.get().max(ts));
        ChangeEvent::delete(tab_id, self.origin.clone(), ts, self.next_sequence())
    }
}

/// Create devices named `device-0`, `device-1` and so on.
pub fn multi_origin_fixtures(count: usize) -> Vec<TabFixture> {
    (0..count)
        .map(|i| TabFixture::new(format!("device-{i}")))
        .collect()
}

/// Fold events over an in-memory tab map, starting from `base`.
///
/// The reference result a store should hold after applying the same
/// events through the sync path.
pub fn replay<'a>(
    base: impl IntoIterator<Item = Tab>,
    events: impl IntoIterator<Item = &'a ChangeEvent>,
) -> Result<BTreeMap<TabId, Tab>, ValidationError> {
    let mut tabs: BTreeMap<TabId, Tab> = base.into_iter().map(|t| (t.id.clone(), t)).collect();
    for event in events {
        let stored = tabs.remove(&event.tab_id);
        if let Some(tab) = apply_event(stored, event)? {
            tabs.insert(tab.id.clone(), tab);
        }
    }
    Ok(tabs)
}
