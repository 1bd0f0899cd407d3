use crate::model::*;

use super::EngineError;

/// Reject empty, reversed, or past-dated windows. `now` is supplied by the caller.
pub fn validate_window(start: Secs, end: Secs, now: Secs) -> Result<Span, EngineError> {
    if start >= end || start < now || end < now {
        return Err(EngineError::InvalidTimestamp { start, end, now });
    }
    Ok(Span::new(start, end))
}
