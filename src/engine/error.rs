use ulid::Ulid;

use crate::model::{Secs, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or past-dated window.
    InvalidTimestamp { start: Secs, end: Secs, now: Secs },
    PersonNotFound(Ulid),
    AlreadyExists(Ulid),
    /// The new availability is wholly inside an existing interval.
    AlreadyAvailable { person_id: Ulid, existing: Span },
    /// At least one participant has no single interval covering the window.
    NoAvailabilityOverlap { person_id: Ulid, span: Span },
    SamePerson(Ulid),
    /// Lock acquisition timed out; the caller may retry.
    ConcurrencyConflict,
    LimitExceeded(&'static str),
    StorageFailure(String),
}

impl EngineError {
    /// Only contention is worth retrying; everything else needs different input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTimestamp { start, end, now } => {
                write!(f, "invalid timestamps: [{start}, {end}) at now={now}")
            }
            EngineError::PersonNotFound(id) => write!(f, "person not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyAvailable { person_id, existing } => write!(
                f,
                "person {person_id} is already available in [{}, {})",
                existing.start, existing.end
            ),
            EngineError::NoAvailabilityOverlap { person_id, span } => write!(
                f,
                "no availability overlap: person {person_id} is not free for all of [{}, {})",
                span.start, span.end
            ),
            EngineError::SamePerson(id) => write!(f, "cannot schedule a meeting of {id} with themself"),
            EngineError::ConcurrencyConflict => {
                write!(f, "concurrency conflict: lock wait timed out, retry")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
