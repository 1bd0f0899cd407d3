use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedPersonState;

/// People, their interval sets, and meetings. Interval sets are only changed
/// through a write guard obtained from a unit of work.
pub struct InMemoryStore {
    people: DashMap<Ulid, SharedPersonState>,
    meetings: DashMap<Ulid, Meeting>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            people: DashMap::new(),
            meetings: DashMap::new(),
        }
    }

    // ── People ───────────────────────────────────────────────

    pub fn person_count(&self) -> usize {
        self.people.len()
    }

    pub fn contains_person(&self, id: &Ulid) -> bool {
        self.people.contains_key(id)
    }

    pub fn get_person(&self, id: &Ulid) -> Option<SharedPersonState> {
        self.people.get(id).map(|e| e.value().clone())
    }

    pub fn insert_person(&self, state: PersonState) {
        self.people.insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// All person ids, ascending. ULIDs sort by creation time.
    pub fn person_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.people.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Meetings ─────────────────────────────────────────────

    pub fn insert_meeting(&self, meeting: Meeting) {
        self.meetings.insert(meeting.id, meeting);
    }

    pub fn meeting_count(&self) -> usize {
        self.meetings.len()
    }

    /// Meetings involving `person_id`, ascending by start.
    pub fn meetings_for(&self, person_id: &Ulid) -> Vec<Meeting> {
        let mut found: Vec<Meeting> = self
            .meetings
            .iter()
            .filter(|e| e.value().involves(person_id))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|m| (m.span.start, m.id));
        found
    }

    pub fn all_meetings(&self) -> Vec<Meeting> {
        let mut all: Vec<Meeting> = self.meetings.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|m| m.id);
        all
    }

    // ── Event application ────────────────────────────────────

    /// Apply the events that live at store level. Interval events are applied
    /// to the locked person state by the unit of work instead.
    pub fn apply_store_event(&self, event: &Event) {
        match event {
            Event::PersonRegistered { id, name } => {
                self.insert_person(PersonState::new(*id, name.clone()));
            }
            Event::MeetingBooked {
                id,
                person_a,
                person_b,
                span,
            } => {
                self.insert_meeting(Meeting {
                    id: *id,
                    person_a: *person_a,
                    person_b: *person_b,
                    span: *span,
                });
            }
            Event::AvailabilityAdded { .. }
            | Event::AvailabilityResized { .. }
            | Event::AvailabilityRemoved { .. } => {}
        }
    }
}
