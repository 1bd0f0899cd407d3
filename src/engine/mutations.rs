use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::intervals::{plan_insert, replace_for_booking};
use super::overlap::covers;
use super::validate::validate_window;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_person(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("person name too long"));
        }
        let _gate = self.acquire(self.commit_gate.read()).await?;
        let _registration = self.acquire(self.registration.lock()).await?;

        if self.store.person_count() >= MAX_PEOPLE {
            return Err(EngineError::LimitExceeded("too many people"));
        }
        if self.store.contains_person(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::PersonRegistered { id, name };
        self.wal_append(Commit {
            events: vec![event.clone()],
        })
        .await?;
        self.store.apply_store_event(&event);
        debug!(%id, "person registered");
        Ok(())
    }

    /// Add `[start, end)` to a person's free time, merging with whatever it
    /// overlaps or touches.
    pub async fn set_availability(&self, person_id: Ulid, start: Secs, end: Secs) -> Result<(), EngineError> {
        if !self.store.contains_person(&person_id) {
            return Err(EngineError::PersonNotFound(person_id));
        }
        let span = validate_window(start, end, self.clock.now())?;

        let mut txn = self.begin(&[person_id]).await?;
        let person = txn
            .person(&person_id)
            .ok_or(EngineError::PersonNotFound(person_id))?;
        let events = plan_insert(person, span, Ulid::new())?;

        let growth = events
            .iter()
            .filter(|e| matches!(e, Event::AvailabilityAdded { .. }))
            .count();
        if person.intervals.len() + growth > MAX_INTERVALS_PER_PERSON {
            return Err(EngineError::LimitExceeded("too many intervals for person"));
        }

        txn.stage(events);
        self.commit(txn).await?;
        debug!(%person_id, start, end, "availability set");
        Ok(())
    }

    /// Book `[start, end)` for two people and carve it out of both interval
    /// sets. Either the meeting and both splits commit together or nothing
    /// changes.
    pub async fn schedule_meeting(
        &self,
        person_a: Ulid,
        person_b: Ulid,
        start: Secs,
        end: Secs,
    ) -> Result<Ulid, EngineError> {
        let span = validate_window(start, end, self.clock.now())?;
        if person_a == person_b {
            return Err(EngineError::SamePerson(person_a));
        }

        let mut txn = self.begin(&[person_a, person_b]).await?;

        let mut splits = Vec::with_capacity(6);
        for pid in [person_a, person_b] {
            let person = txn.person(&pid).ok_or(EngineError::PersonNotFound(pid))?;
            if !covers(&person.intervals, &span) {
                return Err(EngineError::NoAvailabilityOverlap { person_id: pid, span });
            }
            let covering = person
                .covering(&span)
                .ok_or(EngineError::NoAvailabilityOverlap { person_id: pid, span })?;
            splits.extend(replace_for_booking(covering, span));
        }

        let id = Ulid::new();
        txn.stage([Event::MeetingBooked {
            id,
            person_a,
            person_b,
            span,
        }]);
        txn.stage(splits);
        self.commit(txn).await?;

        metrics::counter!(crate::observability::MEETINGS_BOOKED_TOTAL).increment(1);
        info!(%id, %person_a, %person_b, start, end, "meeting booked");
        Ok(id)
    }

    /// Rewrite the WAL with the minimal set of commits that recreates the
    /// current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no unit of work can commit between the snapshot and the swap.
        let _gate = self.commit_gate.write().await;

        let mut commits = Vec::new();
        for id in self.store.person_ids() {
            let Some(person) = self.store.get_person(&id) else {
                continue;
            };
            let guard = person.read().await;
            let mut events = Vec::with_capacity(guard.intervals.len() + 1);
            events.push(Event::PersonRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
            events.extend(guard.intervals.iter().map(|i| Event::AvailabilityAdded {
                id: i.id,
                person_id: i.person_id,
                span: i.span,
            }));
            commits.push(Commit { events });
        }

        let meetings = self.store.all_meetings();
        if !meetings.is_empty() {
            commits.push(Commit {
                events: meetings
                    .into_iter()
                    .map(|m| Event::MeetingBooked {
                        id: m.id,
                        person_a: m.person_a,
                        person_b: m.person_b,
                        span: m.span,
                    })
                    .collect(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
