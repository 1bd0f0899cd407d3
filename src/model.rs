use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix seconds, UTC.
pub type Secs = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Secs,
    pub end: Secs,
}

impl Span {
    pub fn new(start: Secs, end: Secs) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or sharing a boundary.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl AsRef<Span> for Span {
    fn as_ref(&self) -> &Span {
        self
    }
}

/// One stretch of free time belonging to a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityInterval {
    pub id: Ulid,
    pub person_id: Ulid,
    pub span: Span,
}

impl AsRef<Span> for AvailabilityInterval {
    fn as_ref(&self) -> &Span {
        &self.span
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Ulid,
    pub person_a: Ulid,
    pub person_b: Ulid,
    pub span: Span,
}

impl Meeting {
    pub fn involves(&self, person_id: &Ulid) -> bool {
        self.person_a == *person_id || self.person_b == *person_id
    }
}

#[derive(Debug, Clone)]
pub struct PersonState {
    pub id: Ulid,
    pub name: String,
    /// Free intervals sorted by `span.start`; pairwise disjoint and never adjacent.
    pub intervals: Vec<AvailabilityInterval>,
}

impl PersonState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: AvailabilityInterval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<AvailabilityInterval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Change an interval's bounds, keeping its id.
    pub fn resize_interval(&mut self, id: Ulid, span: Span) -> bool {
        match self.remove_interval(id) {
            Some(mut interval) => {
                interval.span = span;
                self.insert_interval(interval);
                true
            }
            None => false,
        }
    }

    /// The interval that fully contains `span`, if any.
    ///
    /// Intervals are disjoint and sorted, so only the last one starting at or
    /// before `span.start` can cover it.
    pub fn covering(&self, span: &Span) -> Option<&AvailabilityInterval> {
        let idx = self
            .intervals
            .partition_point(|i| i.span.start <= span.start)
            .checked_sub(1)?;
        let candidate = &self.intervals[idx];
        candidate.span.contains_span(span).then_some(candidate)
    }

    /// Intervals that overlap or share a boundary with `span`. Always contiguous.
    pub fn touching(&self, span: &Span) -> &[AvailabilityInterval] {
        let lo = self.intervals.partition_point(|i| i.span.end < span.start);
        let hi = self.intervals.partition_point(|i| i.span.start <= span.end);
        &self.intervals[lo..hi.max(lo)]
    }

    /// Intervals with `start >= start_filter` and `end <= end_filter`, ascending.
    pub fn query(&self, start_filter: Option<Secs>, end_filter: Option<Secs>) -> Vec<Span> {
        let lo = start_filter.map_or(0, |s| self.intervals.partition_point(|i| i.span.start < s));
        self.intervals[lo..]
            .iter()
            .map(|i| i.span)
            .filter(|s| end_filter.is_none_or(|e| s.end <= e))
            .collect()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.intervals.iter().map(|i| i.span).collect()
    }
}

/// Flat event types, no nesting. Grouped into a [`Commit`] per WAL frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PersonRegistered {
        id: Ulid,
        name: String,
    },
    AvailabilityAdded {
        id: Ulid,
        person_id: Ulid,
        span: Span,
    },
    AvailabilityResized {
        id: Ulid,
        person_id: Ulid,
        span: Span,
    },
    AvailabilityRemoved {
        id: Ulid,
        person_id: Ulid,
    },
    MeetingBooked {
        id: Ulid,
        person_a: Ulid,
        person_b: Ulid,
        span: Span,
    },
}

impl Event {
    /// The person whose interval set this event mutates, if any.
    pub fn person_id(&self) -> Option<Ulid> {
        match self {
            Event::AvailabilityAdded { person_id, .. }
            | Event::AvailabilityResized { person_id, .. }
            | Event::AvailabilityRemoved { person_id, .. } => Some(*person_id),
            Event::PersonRegistered { .. } | Event::MeetingBooked { .. } => None,
        }
    }
}

/// One atomic unit of work. Replayed entirely or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingInfo {
    pub id: Ulid,
    pub person_a: Ulid,
    pub person_b: Ulid,
    pub start: Secs,
    pub end: Secs,
}

impl From<&Meeting> for MeetingInfo {
    fn from(m: &Meeting) -> Self {
        Self {
            id: m.id,
            person_a: m.person_a,
            person_b: m.person_b,
            start: m.span.start,
            end: m.span.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_with(spans: &[(Secs, Secs)]) -> PersonState {
        let mut ps = PersonState::new(Ulid::new(), "ada".into());
        for &(s, e) in spans {
            ps.insert_interval(AvailabilityInterval {
                id: Ulid::new(),
                person_id: ps.id,
                span: Span::new(s, e),
            });
        }
        ps
    }

    #[test]
    fn span_overlap_and_touch() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.touches(&c));
        assert!(!a.touches(&Span::new(201, 300)));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn interval_ordering() {
        let ps = person_with(&[(300, 400), (100, 200), (500, 600)]);
        let starts: Vec<_> = ps.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 300, 500]);
    }

    #[test]
    fn resize_keeps_id_and_order() {
        let mut ps = person_with(&[(100, 200), (300, 400)]);
        let id = ps.intervals[1].id;
        assert!(ps.resize_interval(id, Span::new(0, 50)));
        assert_eq!(ps.intervals[0].id, id);
        assert_eq!(ps.intervals[0].span, Span::new(0, 50));
        assert!(!ps.resize_interval(Ulid::new(), Span::new(0, 1)));
    }

    #[test]
    fn covering_finds_only_full_containment() {
        let ps = person_with(&[(0, 100), (200, 300)]);
        assert_eq!(ps.covering(&Span::new(10, 90)).unwrap().span, Span::new(0, 100));
        assert_eq!(ps.covering(&Span::new(200, 300)).unwrap().span, Span::new(200, 300));
        assert!(ps.covering(&Span::new(50, 150)).is_none());
        assert!(ps.covering(&Span::new(100, 200)).is_none());
        assert!(person_with(&[]).covering(&Span::new(0, 1)).is_none());
    }

    #[test]
    fn touching_includes_adjacent_and_engulfed() {
        let ps = person_with(&[(0, 100), (150, 160), (200, 300), (400, 500)]);
        let hits: Vec<_> = ps.touching(&Span::new(100, 200)).iter().map(|i| i.span).collect();
        assert_eq!(
            hits,
            vec![Span::new(0, 100), Span::new(150, 160), Span::new(200, 300)]
        );
        assert!(ps.touching(&Span::new(320, 380)).is_empty());
    }

    #[test]
    fn query_filters() {
        let ps = person_with(&[(0, 100), (200, 300), (400, 500)]);
        assert_eq!(ps.query(None, None).len(), 3);
        assert_eq!(
            ps.query(Some(200), None),
            vec![Span::new(200, 300), Span::new(400, 500)]
        );
        assert_eq!(ps.query(None, Some(300)), vec![Span::new(0, 100), Span::new(200, 300)]);
        assert_eq!(ps.query(Some(50), Some(450)), vec![Span::new(200, 300)]);
    }

    #[test]
    fn commit_serialization_roundtrip() {
        let commit = Commit {
            events: vec![
                Event::PersonRegistered {
                    id: Ulid::new(),
                    name: "Ada".into(),
                },
                Event::AvailabilityAdded {
                    id: Ulid::new(),
                    person_id: Ulid::new(),
                    span: Span::new(0, 100),
                },
            ],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
    }
}
