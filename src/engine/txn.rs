use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::model::*;

use super::intervals::apply_interval_event;
use super::{Engine, EngineError};

/// An open unit of work.
///
/// Holds write locks on every person it touches plus a shared hold on the
/// commit gate. Events are staged, then written as one WAL frame and applied
/// by [`Engine::commit`]. Dropping an uncommitted `Txn` is the rollback:
/// nothing staged is ever visible.
pub(crate) struct Txn {
    _gate: OwnedRwLockReadGuard<()>,
    guards: Vec<OwnedRwLockWriteGuard<PersonState>>,
    events: Vec<Event>,
}

impl Txn {
    pub fn person(&self, id: &Ulid) -> Option<&PersonState> {
        self.guards.iter().find(|g| g.id == *id).map(|g| &**g)
    }

    pub fn stage(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }
}

impl Engine {
    /// Open a unit of work over `person_ids`.
    ///
    /// Locks are taken in ascending id order so two units of work over the same
    /// people in opposite roles cannot deadlock. Unknown ids fail with
    /// `PersonNotFound`; lock waits past the timeout fail with
    /// `ConcurrencyConflict`.
    pub(crate) async fn begin(&self, person_ids: &[Ulid]) -> Result<Txn, EngineError> {
        let mut ids = person_ids.to_vec();
        ids.sort();
        ids.dedup();

        for id in &ids {
            if !self.store.contains_person(id) {
                return Err(EngineError::PersonNotFound(*id));
            }
        }

        let gate = self.acquire(self.commit_gate.clone().read_owned()).await?;
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let person = self
                .store
                .get_person(id)
                .ok_or(EngineError::PersonNotFound(*id))?;
            guards.push(self.acquire(person.write_owned()).await?);
        }

        Ok(Txn {
            _gate: gate,
            guards,
            events: Vec::new(),
        })
    }

    /// Persist the staged events as one WAL frame, then apply them.
    /// On a storage failure nothing is applied.
    pub(crate) async fn commit(&self, mut txn: Txn) -> Result<(), EngineError> {
        if txn.events.is_empty() {
            return Ok(());
        }
        let commit = Commit {
            events: std::mem::take(&mut txn.events),
        };
        self.wal_append(commit.clone()).await?;

        for event in &commit.events {
            match event.person_id() {
                Some(pid) => {
                    if let Some(guard) = txn.guards.iter_mut().find(|g| g.id == pid) {
                        apply_interval_event(guard, event);
                    }
                }
                None => self.store.apply_store_event(event),
            }
        }
        metrics::counter!(crate::observability::COMMITS_TOTAL).increment(1);
        Ok(())
    }
}
