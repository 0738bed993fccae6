use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds on a timezone-free timeline — the only time type.
pub type Ms = i64;

pub type EventId = u64;
pub type ResourceId = u64;

pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Length of the intersection in ms, 0 when disjoint.
    pub fn overlap_ms(&self, other: &Span) -> Ms {
        let latest_start = self.start.max(other.start);
        let earliest_end = self.end.min(other.end);
        (earliest_end - latest_start).max(0)
    }

    /// Length of the intersection in fractional hours. Not rounded.
    pub fn overlap_hours(&self, other: &Span) -> f64 {
        self.overlap_ms(other) as f64 / MS_PER_HOUR
    }
}

/// A persisted event. It has an identity; see [`EventDraft`] for the unsaved form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub span: Span,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    /// Free-form type tag, e.g. "room" or "instructor".
    pub kind: String,
}

/// One resource assigned to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub event_id: EventId,
    pub resource_id: ResourceId,
}

/// An event that has not been saved yet, or the submitted values of an edit.
///
/// `start`/`end` are kept raw so an invalid window can still be echoed back to
/// the caller; `engine::validate_window` turns them into a [`Span`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub start: Ms,
    pub end: Ms,
    pub resource_ids: Vec<ResourceId>,
}

impl EventDraft {
    /// Prefill from a persisted event and its current allocation set.
    pub fn from_event(event: &Event, resource_ids: Vec<ResourceId>) -> Self {
        Self {
            title: event.title.clone(),
            description: event.description.clone(),
            start: event.span.start,
            end: event.span.end,
            resource_ids,
        }
    }
}

/// Partial edit of an event. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub resource_ids: Option<Vec<ResourceId>>,
}

impl EventChanges {
    pub fn apply(self, mut draft: EventDraft) -> EventDraft {
        if let Some(title) = self.title {
            draft.title = title;
        }
        if let Some(description) = self.description {
            draft.description = description;
        }
        if let Some(start) = self.start {
            draft.start = start;
        }
        if let Some(end) = self.end {
            draft.end = end;
        }
        if let Some(ids) = self.resource_ids {
            draft.resource_ids = ids;
        }
        draft
    }
}

/// An event as seen from one resource's allocation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub allocation_id: Ulid,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Events allocated to this resource, sorted by `event.span.start`.
    pub slots: Vec<Slot>,
    /// Set under the write lock when the resource is deleted, so a writer that
    /// looked the state up before the delete can tell it is gone.
    pub deleted: bool,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            slots: Vec::new(),
            deleted: false,
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .partition_point(|s| s.event.span.start <= slot.event.span.start);
        self.slots.insert(pos, slot);
    }

    /// Remove the slot held by `event_id`. An event holds at most one slot per resource.
    pub fn remove_event(&mut self, event_id: EventId) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.event.id == event_id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose event overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.event.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.event.span.end > query.start)
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.slots.iter().map(|s| &s.event)
    }
}

#[derive(Debug, Clone)]
pub struct EventState {
    pub event: Event,
    pub deleted: bool,
}

/// Log record format. One record per committed operation; cascades are carried
/// inside the record so replay never sees half of a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    ResourceCreated {
        resource: Resource,
    },
    ResourceUpdated {
        resource: Resource,
    },
    ResourceDeleted {
        id: ResourceId,
        allocations: Vec<Ulid>,
    },
    EventCreated {
        event: Event,
        allocations: Vec<Allocation>,
    },
    /// Replaces the event and its whole allocation set.
    EventUpdated {
        event: Event,
        allocations: Vec<Allocation>,
    },
    EventDeleted {
        id: EventId,
        allocations: Vec<Ulid>,
    },
    /// Id high-water marks. Heads a compacted log so ids of deleted rows stay retired.
    IdCounters {
        next_resource_id: ResourceId,
        next_event_id: EventId,
    },
}

// ── Query result types ───────────────────────────────────────────

/// An existing allocation that overlaps a candidate window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub event: Event,
    pub resource: Resource,
}

/// Two stored events overlapping on the same resource. `event_a.span.start <= event_b.span.start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPair {
    pub resource: Resource,
    pub event_a: Event,
    pub event_b: Event,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationRow {
    pub resource: Resource,
    /// Occupied hours inside the reporting window, rounded to 2 decimals.
    pub total_hours: f64,
    /// Events starting at or after `now`, ascending by start.
    pub upcoming: Vec<Event>,
}
