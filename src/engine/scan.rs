use crate::model::*;

use super::store::AllocationStore;
use super::EngineError;

/// Order a resource's events for scanning: ascending start, ties by id.
pub fn sort_for_scan(events: &mut [Event]) {
    events.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
}

/// Reference scan: test every unordered pair `(i, j)`, `i < j`.
///
/// `sorted` must be ordered by [`sort_for_scan`]. O(n²).
pub fn overlapping_pairs_quadratic(sorted: &[Event]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..sorted.len() {
        for j in (i + 1)..sorted.len() {
            if sorted[i].span.overlaps(&sorted[j].span) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Sweep-line scan producing exactly the pairs of
/// [`overlapping_pairs_quadratic`], in the same order.
///
/// Since starts are ascending, once `sorted[j].start >= sorted[i].end` no later
/// `j` can overlap `i`, and every `j` before that point does. O(n + k) after sorting.
pub fn overlapping_pairs(sorted: &[Event]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, a) in sorted.iter().enumerate() {
        for (j, b) in sorted.iter().enumerate().skip(i + 1) {
            if b.span.start >= a.span.end {
                break;
            }
            pairs.push((i, j));
        }
    }
    pairs
}

/// Full audit: every pair of stored events that overlap on the same resource.
///
/// Grouped by resource in store order; within a resource, pairs follow `i < j`
/// over the start-sorted event list.
pub async fn find_all_conflicts<S: AllocationStore + ?Sized>(
    store: &S,
) -> Result<Vec<ConflictPair>, EngineError> {
    let mut out = Vec::new();
    for (resource, mut events) in store.all_resources_with_allocations().await? {
        sort_for_scan(&mut events);
        for (i, j) in overlapping_pairs(&events) {
            out.push(ConflictPair {
                resource: resource.clone(),
                event_a: events[i].clone(),
                event_b: events[j].clone(),
            });
        }
    }
    Ok(out)
}
