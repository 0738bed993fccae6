use std::collections::HashSet;

use crate::limits::*;
use crate::model::*;

use super::store::AllocationStore;
use super::EngineError;

/// Turn a raw `[start, end)` pair into a [`Span`], rejecting `start >= end`.
pub fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidTimeRange { start, end });
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_span_limits(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Events that overlap `window`, skipping `exclude`.
///
/// Keeps `e` iff `e.start < window.end && e.end > window.start`.
pub fn overlapping_events<'a, I>(
    events: I,
    window: Span,
    exclude: Option<EventId>,
) -> impl Iterator<Item = &'a Event>
where
    I: IntoIterator<Item = &'a Event>,
{
    events
        .into_iter()
        .filter(move |e| Some(e.id) != exclude && e.span.overlaps(&window))
}

/// Find every existing allocation that overlaps the candidate window on any of
/// `resource_ids`.
///
/// One record per (event, resource): an event booked on two requested resources
/// shows up twice. Unknown ids contribute nothing. Repeated ids are checked once.
pub async fn check_conflicts<S: AllocationStore + ?Sized>(
    store: &S,
    start: Ms,
    end: Ms,
    resource_ids: &[ResourceId],
    exclude: Option<EventId>,
) -> Result<Vec<Conflict>, EngineError> {
    let window = validate_window(start, end)?;
    if resource_ids.len() > MAX_IN_CLAUSE_IDS {
        return Err(EngineError::LimitExceeded("too many resource IDs"));
    }

    let mut seen = HashSet::new();
    let mut conflicts = Vec::new();
    for &rid in resource_ids {
        if !seen.insert(rid) {
            continue;
        }
        let events = store.events_allocated_to(rid, exclude).await?;
        let mut hits = overlapping_events(&events, window, exclude).peekable();
        if hits.peek().is_none() {
            continue;
        }
        let Some(resource) = store.resource(rid).await? else {
            continue;
        };
        conflicts.extend(hits.map(|event| Conflict {
            event: event.clone(),
            resource: resource.clone(),
        }));
    }
    Ok(conflicts)
}

/// Conflicts against a resource whose write lock the caller already holds.
pub(super) fn conflicts_in(rs: &ResourceState, window: &Span, exclude: Option<EventId>) -> Vec<Conflict> {
    overlapping_events(rs.overlapping(window).map(|s| &s.event), *window, exclude)
        .map(|event| Conflict {
            event: event.clone(),
            resource: rs.resource.clone(),
        })
        .collect()
}
