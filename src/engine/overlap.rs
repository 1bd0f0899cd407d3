use crate::model::*;

// ── Overlap Algorithm ─────────────────────────────────────────────

/// Intersect two sorted, internally disjoint interval sets.
///
/// Two-pointer sweep: emit the overlap of the current pair, then advance
/// whichever side ends first. O(n + m), output ascending by start.
pub fn intersect<A: AsRef<Span>, B: AsRef<Span>>(a: &[A], b: &[B]) -> Vec<Span> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        let x = a[i].as_ref();
        let y = b[j].as_ref();

        let start = x.start.max(y.start);
        let end = x.end.min(y.end);
        if start < end {
            result.push(Span::new(start, end));
        }

        if x.end <= y.end {
            i += 1;
        } else {
            j += 1;
        }
    }

    result
}

/// True iff one interval fully contains `window`. Stricter than overlap.
pub fn covers<T: AsRef<Span>>(intervals: &[T], window: &Span) -> bool {
    intervals.iter().any(|i| i.as_ref().contains_span(window))
}
