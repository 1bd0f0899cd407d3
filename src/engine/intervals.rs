use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Plan the events that add `span` to a person's availability.
///
/// Every stored interval that overlaps or shares a boundary with `span` is
/// coalesced with it into one interval: the earliest keeps its id and is
/// resized to the union, the rest are removed. With nothing touching, a new
/// interval is added. A span already inside one interval is rejected.
pub fn plan_insert(person: &PersonState, span: Span, new_id: Ulid) -> Result<Vec<Event>, EngineError> {
    if let Some(existing) = person.covering(&span) {
        return Err(EngineError::AlreadyAvailable {
            person_id: person.id,
            existing: existing.span,
        });
    }

    let touching = person.touching(&span);
    let Some((keep, rest)) = touching.split_first() else {
        return Ok(vec![Event::AvailabilityAdded {
            id: new_id,
            person_id: person.id,
            span,
        }]);
    };

    let start = span.start.min(keep.span.start);
    let end = touching.iter().fold(span.end, |end, i| end.max(i.span.end));

    let mut events = Vec::with_capacity(touching.len());
    events.push(Event::AvailabilityResized {
        id: keep.id,
        person_id: person.id,
        span: Span::new(start, end),
    });
    events.extend(rest.iter().map(|i| Event::AvailabilityRemoved {
        id: i.id,
        person_id: person.id,
    }));
    Ok(events)
}

/// Plan the events that carve `span` out of the interval covering it.
///
/// The covering interval is removed and up to two remainders take its place:
/// `[covering.start, span.start)` and `[span.end, covering.end)`, each only
/// when non-empty.
pub fn replace_for_booking(covering: &AvailabilityInterval, span: Span) -> Vec<Event> {
    debug_assert!(covering.span.contains_span(&span));
    let person_id = covering.person_id;

    let mut events = vec![Event::AvailabilityRemoved {
        id: covering.id,
        person_id,
    }];
    if covering.span.start < span.start {
        events.push(Event::AvailabilityAdded {
            id: Ulid::new(),
            person_id,
            span: Span::new(covering.span.start, span.start),
        });
    }
    if covering.span.end > span.end {
        events.push(Event::AvailabilityAdded {
            id: Ulid::new(),
            person_id,
            span: Span::new(span.end, covering.span.end),
        });
    }
    events
}

/// Apply interval events to one person's state. Events for other people and
/// non-interval events are ignored.
pub fn apply_interval_event(person: &mut PersonState, event: &Event) {
    match event {
        Event::AvailabilityAdded { id, person_id, span } if *person_id == person.id => {
            person.insert_interval(AvailabilityInterval {
                id: *id,
                person_id: *person_id,
                span: *span,
            });
        }
        Event::AvailabilityResized { id, person_id, span } if *person_id == person.id => {
            person.resize_interval(*id, *span);
        }
        Event::AvailabilityRemoved { id, person_id } if *person_id == person.id => {
            person.remove_interval(*id);
        }
        _ => {}
    }
}
