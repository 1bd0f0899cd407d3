mod error;
mod intervals;
mod mutations;
mod overlap;
mod queries;
mod store;
mod txn;
mod validate;

pub use error::EngineError;
pub use intervals::{plan_insert, replace_for_booking};
pub use overlap::{covers, intersect};
pub use store::InMemoryStore;
pub use validate::validate_window;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::DEFAULT_LOCK_TIMEOUT;
use crate::model::*;
use crate::wal::Wal;

pub type SharedPersonState = Arc<RwLock<PersonState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        // Appends are batched by the caller loop and never reach here.
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to non-append handler")));
        }
    }
}

/// Knobs the embedding process controls.
#[derive(Clone)]
pub struct EngineOptions {
    pub clock: Arc<dyn Clock>,
    /// Upper bound on waiting for any lock; expiry surfaces as `ConcurrencyConflict`.
    pub lock_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every unit of work, exclusively by compaction.
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Serializes registrations so duplicate ids are caught before the WAL.
    pub(super) registration: Mutex<()>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) lock_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let commits = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        let replayed = commits.len();
        for (person_id, state) in replay(&commits) {
            debug_assert_eq!(person_id, state.id);
            store.insert_person(state);
        }
        for commit in &commits {
            for event in &commit.events {
                if matches!(event, Event::MeetingBooked { .. }) {
                    store.apply_store_event(event);
                }
            }
        }
        if replayed > 0 {
            info!(
                commits = replayed,
                people = store.person_count(),
                meetings = store.meeting_count(),
                "replayed WAL"
            );
        }

        Ok(Self {
            store,
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            registration: Mutex::new(()),
            clock: options.clock,
            lock_timeout: options.lock_timeout,
        })
    }

    /// Write a commit to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub fn get_person(&self, id: &Ulid) -> Option<SharedPersonState> {
        self.store.get_person(id)
    }

    /// Await a lock, giving up after the configured timeout.
    pub(super) async fn acquire<G>(&self, lock: impl Future<Output = G>) -> Result<G, EngineError> {
        tokio::time::timeout(self.lock_timeout, lock)
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::ConcurrencyConflict
            })
    }
}

/// Rebuild every person's state from the commits on disk. Runs before the
/// engine is shared, so plain owned values are enough.
fn replay(commits: &[Commit]) -> HashMap<Ulid, PersonState> {
    let mut people: HashMap<Ulid, PersonState> = HashMap::new();
    for event in commits.iter().flat_map(|c| c.events.iter()) {
        match event {
            Event::PersonRegistered { id, name } => {
                people.insert(*id, PersonState::new(*id, name.clone()));
            }
            other => {
                if let Some(person) = other.person_id().and_then(|pid| people.get_mut(&pid)) {
                    intervals::apply_interval_event(person, other);
                }
            }
        }
    }
    people
}
