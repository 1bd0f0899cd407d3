use ulid::Ulid;

use crate::model::*;

use super::overlap::intersect;
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_people(&self) -> Vec<PersonInfo> {
        let mut people = Vec::new();
        for id in self.store.person_ids() {
            if let Some(person) = self.store.get_person(&id) {
                let guard = person.read().await;
                people.push(PersonInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                });
            }
        }
        people
    }

    /// A person's free intervals, ascending, optionally restricted to those
    /// starting at or after `start` and ending at or before `end`.
    pub async fn get_availability(
        &self,
        person_id: Ulid,
        start: Option<Secs>,
        end: Option<Secs>,
    ) -> Result<Vec<Span>, EngineError> {
        let person = self
            .store
            .get_person(&person_id)
            .ok_or(EngineError::PersonNotFound(person_id))?;
        let guard = self.acquire(person.read()).await?;
        Ok(guard.query(start, end))
    }

    /// Time both people are free, ascending.
    ///
    /// Both read locks are held together while the sets are copied, so the
    /// result never mixes states from before and after a booking.
    pub async fn find_overlap(&self, person_a: Ulid, person_b: Ulid) -> Result<Vec<Span>, EngineError> {
        let a = self
            .store
            .get_person(&person_a)
            .ok_or(EngineError::PersonNotFound(person_a))?;
        let b = self
            .store
            .get_person(&person_b)
            .ok_or(EngineError::PersonNotFound(person_b))?;

        if person_a == person_b {
            return Ok(self.acquire(a.read()).await?.spans());
        }

        let (first, second) = if person_a < person_b { (&a, &b) } else { (&b, &a) };
        let first_guard = self.acquire(first.read()).await?;
        let second_guard = self.acquire(second.read()).await?;
        Ok(intersect(&first_guard.intervals, &second_guard.intervals))
    }

    /// Meetings a person takes part in, ascending by start.
    pub fn get_meetings(&self, person_id: Ulid) -> Result<Vec<MeetingInfo>, EngineError> {
        if !self.store.contains_person(&person_id) {
            return Err(EngineError::PersonNotFound(person_id));
        }
        Ok(self
            .store
            .meetings_for(&person_id)
            .iter()
            .map(MeetingInfo::from)
            .collect())
    }
}
