use async_trait::async_trait;

use crate::model::*;

use super::{Engine, EngineError};

/// Read side of the allocation data consumed by the conflict detector,
/// the pairwise scanner and the utilization report.
///
/// Unknown resource ids are not an error: they have no resource and no events.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>, EngineError>;

    /// Events allocated to `resource_id`, minus `exclude` if given, ascending by start.
    async fn events_allocated_to(
        &self,
        resource_id: ResourceId,
        exclude: Option<EventId>,
    ) -> Result<Vec<Event>, EngineError>;

    /// Every resource with the events allocated to it, in the store's enumeration order.
    async fn all_resources_with_allocations(&self) -> Result<Vec<(Resource, Vec<Event>)>, EngineError>;
}

#[async_trait]
impl AllocationStore for Engine {
    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>, EngineError> {
        let Some(rs) = self.get_resource_state(&id) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        Ok((!guard.deleted).then(|| guard.resource.clone()))
    }

    async fn events_allocated_to(
        &self,
        resource_id: ResourceId,
        exclude: Option<EventId>,
    ) -> Result<Vec<Event>, EngineError> {
        let Some(rs) = self.get_resource_state(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(guard
            .events()
            .filter(|e| Some(e.id) != exclude)
            .cloned()
            .collect())
    }

    /// Resources come back ascending by id. Each resource is read under its own
    /// lock, so the result is per-resource consistent, not a global snapshot.
    async fn all_resources_with_allocations(&self) -> Result<Vec<(Resource, Vec<Event>)>, EngineError> {
        let mut out = Vec::new();
        for id in self.resource_ids() {
            let Some(rs) = self.get_resource_state(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            out.push((guard.resource.clone(), guard.events().cloned().collect()));
        }
        Ok(out)
    }
}

/// A frozen copy of the allocation data. Batch queries over a snapshot never
/// touch engine locks and always see the same data.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    resources: Vec<(Resource, Vec<Event>)>,
}

impl Snapshot {
    pub fn new(resources: Vec<(Resource, Vec<Event>)>) -> Self {
        let resources = resources
            .into_iter()
            .map(|(r, mut events)| {
                events.sort_by_key(|e| e.span.start);
                (r, events)
            })
            .collect();
        Self { resources }
    }

    pub async fn capture<S: AllocationStore + ?Sized>(store: &S) -> Result<Self, EngineError> {
        Ok(Self::new(store.all_resources_with_allocations().await?))
    }

    pub fn resources(&self) -> &[(Resource, Vec<Event>)] {
        &self.resources
    }
}

#[async_trait]
impl AllocationStore for Snapshot {
    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>, EngineError> {
        Ok(self
            .resources
            .iter()
            .find(|(r, _)| r.id == id)
            .map(|(r, _)| r.clone()))
    }

    async fn events_allocated_to(
        &self,
        resource_id: ResourceId,
        exclude: Option<EventId>,
    ) -> Result<Vec<Event>, EngineError> {
        Ok(self
            .resources
            .iter()
            .find(|(r, _)| r.id == resource_id)
            .map(|(_, events)| {
                events
                    .iter()
                    .filter(|e| Some(e.id) != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn all_resources_with_allocations(&self) -> Result<Vec<(Resource, Vec<Event>)>, EngineError> {
        Ok(self.resources.clone())
    }
}
