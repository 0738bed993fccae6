use crate::model::*;
use crate::time::now_ms;

use super::conflict::check_conflicts;
use super::report::build_report;
use super::scan::find_all_conflicts;
use super::store::Snapshot;
use super::{Engine, EngineError};

/// Which allocation rows `list_allocations` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationFilter {
    All,
    Event(EventId),
    Resource(ResourceId),
}

impl AllocationFilter {
    fn matches(&self, allocation: &Allocation) -> bool {
        match self {
            AllocationFilter::All => true,
            AllocationFilter::Event(id) => allocation.event_id == *id,
            AllocationFilter::Resource(id) => allocation.resource_id == *id,
        }
    }
}

impl Engine {
    pub async fn get_event(&self, id: EventId) -> Result<Event, EngineError> {
        let es = self.get_event_state(&id).ok_or(EngineError::EventNotFound(id))?;
        let guard = es.read().await;
        if guard.deleted {
            return Err(EngineError::EventNotFound(id));
        }
        Ok(guard.event.clone())
    }

    pub async fn get_resource(&self, id: ResourceId) -> Result<Resource, EngineError> {
        let rs = self
            .get_resource_state(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::ResourceNotFound(id));
        }
        Ok(guard.resource.clone())
    }

    /// All resources, ascending by id.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let mut out = Vec::with_capacity(self.resource_count());
        for id in self.resource_ids() {
            if let Ok(resource) = self.get_resource(id).await {
                out.push(resource);
            }
        }
        out
    }

    /// All events, ascending by start, then id.
    pub async fn list_events(&self) -> Vec<Event> {
        let mut out = Vec::with_capacity(self.event_count());
        for id in self.event_ids() {
            if let Ok(event) = self.get_event(id).await {
                out.push(event);
            }
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Allocation rows ordered by (event id, resource id).
    pub fn list_allocations(&self, filter: AllocationFilter) -> Vec<Allocation> {
        let mut rows: Vec<Allocation> = match filter {
            AllocationFilter::Event(id) => self.allocations_of_event(id),
            _ => self
                .all_allocations()
                .into_iter()
                .filter(|a| filter.matches(a))
                .collect(),
        };
        rows.sort_by_key(|a| (a.event_id, a.resource_id));
        rows
    }

    /// Current allocation set of an event, ascending.
    pub async fn event_resource_ids(&self, event_id: EventId) -> Result<Vec<ResourceId>, EngineError> {
        // Existence check only.
        self.get_event(event_id).await?;
        let mut ids: Vec<ResourceId> = self
            .allocations_of_event(event_id)
            .iter()
            .map(|a| a.resource_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Edit form for an existing event: its fields plus its current allocation set.
    pub async fn draft_for(&self, event_id: EventId) -> Result<EventDraft, EngineError> {
        let event = self.get_event(event_id).await?;
        let resource_ids = self.event_resource_ids(event_id).await?;
        Ok(EventDraft::from_event(&event, resource_ids))
    }

    /// Frozen copy of every resource and its events.
    pub async fn snapshot(&self) -> Result<Snapshot, EngineError> {
        Snapshot::capture(self).await
    }

    // ── Core operations against live state ──────────────────

    pub async fn check_conflicts(
        &self,
        start: Ms,
        end: Ms,
        resource_ids: &[ResourceId],
        exclude: Option<EventId>,
    ) -> Result<Vec<Conflict>, EngineError> {
        check_conflicts(self, start, end, resource_ids, exclude).await
    }

    pub async fn find_all_conflicts(&self) -> Result<Vec<ConflictPair>, EngineError> {
        let pairs = find_all_conflicts(self).await?;
        if !pairs.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL)
                .increment(pairs.len() as u64);
        }
        Ok(pairs)
    }

    /// Utilization over `[range_start, range_end)`. `now` defaults to the local wall clock.
    pub async fn utilization_report(
        &self,
        range_start: Ms,
        range_end: Ms,
        now: Option<Ms>,
    ) -> Result<Vec<UtilizationRow>, EngineError> {
        build_report(self, range_start, range_end, now.unwrap_or_else(now_ms)).await
    }
}
