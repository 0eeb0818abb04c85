//! Latest event per category

use modelhost_core::{Event, EventCategory};
use std::collections::HashMap;
use std::sync::RwLock;

/// Holds exactly the most recent event of each category
///
/// Written only by the bus publish path; reads never wait on publication to
/// subscribers.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    latest: RwLock<HashMap<EventCategory, Event>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn store(&self, event: Event) {
        let mut latest = self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        latest.insert(event.category(), event);
    }

    pub fn get(&self, category: EventCategory) -> Option<Event> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&category)
            .cloned()
    }

    /// Every stored event in `EventCategory::ALL` order
    pub fn all(&self) -> Vec<Event> {
        let latest = self
            .latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        EventCategory::ALL
            .iter()
            .filter_map(|category| latest.get(category).cloned())
            .collect()
    }

    pub fn categories(&self) -> Vec<EventCategory> {
        self.all().iter().map(Event::category).collect()
    }
}
