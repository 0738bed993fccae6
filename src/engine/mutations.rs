use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{conflicts_in, validate_span_limits, validate_window};
use super::{Engine, EngineError, WalCommand};

/// Write guards over a set of resources, taken in ascending id order.
struct LockedResources {
    guards: BTreeMap<ResourceId, OwnedRwLockWriteGuard<ResourceState>>,
}

impl LockedResources {
    /// Every id in `wanted` must be present and live.
    fn require(&self, wanted: &[ResourceId]) -> Result<(), EngineError> {
        for rid in wanted {
            match self.guards.get(rid) {
                None => return Err(EngineError::ResourceNotFound(*rid)),
                Some(guard) if guard.deleted => return Err(EngineError::ConcurrencyConflict(*rid)),
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn conflicts(&self, wanted: &[ResourceId], window: &Span, exclude: Option<EventId>) -> Vec<Conflict> {
        wanted
            .iter()
            .filter_map(|rid| self.guards.get(rid))
            .flat_map(|guard| conflicts_in(guard, window, exclude))
            .collect()
    }

    fn get_mut(&mut self, rid: ResourceId) -> Option<&mut ResourceState> {
        self.guards.get_mut(&rid).map(|g| &mut **g)
    }
}

struct ValidDraft {
    title: String,
    description: String,
    span: Span,
    /// Sorted, no duplicates.
    resource_ids: Vec<ResourceId>,
}

fn validate_draft(draft: &EventDraft) -> Result<ValidDraft, EngineError> {
    let span = validate_window(draft.start, draft.end)?;
    validate_span_limits(&span)?;
    let title = draft.title.trim();
    if title.is_empty() {
        return Err(EngineError::InvalidInput("title is required"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if draft.description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    let mut resource_ids = draft.resource_ids.clone();
    resource_ids.sort_unstable();
    resource_ids.dedup();
    if resource_ids.len() > MAX_RESOURCES_PER_EVENT {
        return Err(EngineError::LimitExceeded("too many resources on event"));
    }
    Ok(ValidDraft {
        title: title.to_string(),
        description: draft.description.clone(),
        span,
        resource_ids,
    })
}

fn validate_resource_fields(name: &str, kind: &str) -> Result<(String, String), EngineError> {
    let (name, kind) = (name.trim(), kind.trim());
    if name.is_empty() || kind.is_empty() {
        return Err(EngineError::InvalidInput("name and type are required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    if kind.len() > MAX_KIND_LEN {
        return Err(EngineError::LimitExceeded("resource type too long"));
    }
    Ok((name.to_string(), kind.to_string()))
}

fn new_allocations(event_id: EventId, resource_ids: &[ResourceId]) -> Vec<Allocation> {
    resource_ids
        .iter()
        .map(|&resource_id| Allocation {
            id: Ulid::new(),
            event_id,
            resource_id,
        })
        .collect()
}

fn sorted_union(a: impl IntoIterator<Item = ResourceId>, b: &[ResourceId]) -> Vec<ResourceId> {
    let mut ids: Vec<ResourceId> = a.into_iter().chain(b.iter().copied()).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl Engine {
    /// Acquire write locks in ascending id order to prevent deadlocks.
    /// `ids` must be sorted. Ids missing from the map are skipped.
    async fn lock_resources(&self, ids: &[ResourceId]) -> LockedResources {
        let mut guards = BTreeMap::new();
        for rid in ids {
            if let Some(rs) = self.get_resource_state(rid) {
                guards.insert(*rid, rs.write_owned().await);
            }
        }
        LockedResources { guards }
    }

    fn reject_conflicts(&self, conflicts: Vec<Conflict>) -> EngineError {
        metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL).increment(1);
        debug!(count = conflicts.len(), "write rejected: resource conflict");
        EngineError::Conflict(conflicts)
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, name: &str, kind: &str) -> Result<Resource, EngineError> {
        let (name, kind) = validate_resource_fields(name, kind)?;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let _gate = self.commit_gate.read().await;

        let resource = Resource {
            id: self.allocate_resource_id(),
            name,
            kind,
        };
        self.wal_append(&Change::ResourceCreated {
            resource: resource.clone(),
        })
        .await?;
        self.resources.insert(
            resource.id,
            Arc::new(RwLock::new(ResourceState::new(resource.clone()))),
        );
        info!(resource_id = resource.id, "resource created");
        Ok(resource)
    }

    pub async fn update_resource(&self, id: ResourceId, name: &str, kind: &str) -> Result<Resource, EngineError> {
        validate_resource_fields(name, kind)?;
        self.edit_resource(id, |_| (name.to_string(), kind.to_string())).await
    }

    /// Change only the given fields, merged with the stored row under its write lock.
    pub async fn patch_resource(
        &self,
        id: ResourceId,
        name: Option<String>,
        kind: Option<String>,
    ) -> Result<Resource, EngineError> {
        self.edit_resource(id, |current| {
            (
                name.unwrap_or_else(|| current.name.clone()),
                kind.unwrap_or_else(|| current.kind.clone()),
            )
        })
        .await
    }

    async fn edit_resource(
        &self,
        id: ResourceId,
        edit: impl FnOnce(&Resource) -> (String, String),
    ) -> Result<Resource, EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self
            .get_resource_state(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::ResourceNotFound(id));
        }
        let (name, kind) = edit(&guard.resource);
        let (name, kind) = validate_resource_fields(&name, &kind)?;

        let resource = Resource { id, name, kind };
        self.wal_append(&Change::ResourceUpdated {
            resource: resource.clone(),
        })
        .await?;
        guard.resource = resource.clone();
        info!(resource_id = id, "resource updated");
        Ok(resource)
    }

    /// Delete a resource and, in the same WAL record, every allocation on it.
    pub async fn delete_resource(&self, id: ResourceId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self
            .get_resource_state(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::ResourceNotFound(id));
        }

        // Step 1: collect dependent allocations.
        let allocations: Vec<Ulid> = guard.slots.iter().map(|s| s.allocation_id).collect();
        self.wal_append(&Change::ResourceDeleted {
            id,
            allocations: allocations.clone(),
        })
        .await?;

        // Step 2: delete them, then the resource.
        for allocation_id in &allocations {
            self.unindex_allocation(allocation_id);
        }
        guard.slots.clear();
        guard.deleted = true;
        self.resources.remove(&id);
        info!(resource_id = id, cascaded = allocations.len(), "resource deleted");
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────

    /// Save a draft as a new event, allocating every selected resource.
    ///
    /// Conflicts are re-checked while holding the write locks of all selected
    /// resources, so two overlapping creates cannot both commit.
    pub async fn create_event(&self, draft: EventDraft) -> Result<Event, EngineError> {
        let valid = validate_draft(&draft)?;
        if self.events.len() >= MAX_EVENTS {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        let _gate = self.commit_gate.read().await;

        let mut locked = self.lock_resources(&valid.resource_ids).await;
        locked.require(&valid.resource_ids)?;
        let conflicts = locked.conflicts(&valid.resource_ids, &valid.span, None);
        if !conflicts.is_empty() {
            return Err(self.reject_conflicts(conflicts));
        }

        let event = Event {
            id: self.allocate_event_id(),
            title: valid.title,
            span: valid.span,
            description: valid.description,
        };
        let allocations = new_allocations(event.id, &valid.resource_ids);
        self.wal_append(&Change::EventCreated {
            event: event.clone(),
            allocations: allocations.clone(),
        })
        .await?;

        self.events.insert(
            event.id,
            Arc::new(RwLock::new(EventState {
                event: event.clone(),
                deleted: false,
            })),
        );
        self.event_allocations.entry(event.id).or_default();
        for allocation in &allocations {
            if let Some(rs) = locked.get_mut(allocation.resource_id) {
                rs.insert_slot(Slot {
                    allocation_id: allocation.id,
                    event: event.clone(),
                });
            }
            self.index_allocation(*allocation);
        }
        info!(
            event_id = event.id,
            resources = allocations.len(),
            "event created"
        );
        Ok(event)
    }

    /// Replace an event's fields and its whole allocation set.
    ///
    /// The event is checked against everything except itself, so keeping the
    /// current window never conflicts with its own old allocations.
    pub async fn update_event(&self, id: EventId, draft: EventDraft) -> Result<Event, EngineError> {
        validate_draft(&draft)?;
        self.edit_event(id, |_| draft).await
    }

    /// Apply a partial edit on top of the event's current state, read under its lock.
    pub async fn patch_event(&self, id: EventId, changes: EventChanges) -> Result<Event, EngineError> {
        self.edit_event(id, |current| changes.apply(current)).await
    }

    async fn edit_event(
        &self,
        id: EventId,
        edit: impl FnOnce(EventDraft) -> EventDraft,
    ) -> Result<Event, EngineError> {
        let _gate = self.commit_gate.read().await;
        let es = self
            .get_event_state(&id)
            .ok_or(EngineError::EventNotFound(id))?;
        let mut event_guard = es.write().await;
        if event_guard.deleted {
            return Err(EngineError::EventNotFound(id));
        }

        let old = self.allocations_of_event(id);
        let mut current_ids: Vec<ResourceId> = old.iter().map(|a| a.resource_id).collect();
        current_ids.sort_unstable();
        let valid = validate_draft(&edit(EventDraft::from_event(&event_guard.event, current_ids)))?;
        let lock_ids = sorted_union(old.iter().map(|a| a.resource_id), &valid.resource_ids);
        let mut locked = self.lock_resources(&lock_ids).await;
        locked.require(&valid.resource_ids)?;
        let conflicts = locked.conflicts(&valid.resource_ids, &valid.span, Some(id));
        if !conflicts.is_empty() {
            return Err(self.reject_conflicts(conflicts));
        }

        let event = Event {
            id,
            title: valid.title,
            span: valid.span,
            description: valid.description,
        };
        let allocations = new_allocations(id, &valid.resource_ids);
        self.wal_append(&Change::EventUpdated {
            event: event.clone(),
            allocations: allocations.clone(),
        })
        .await?;

        // Delete all, then insert the selection.
        for allocation in &old {
            self.unindex_allocation(&allocation.id);
        }
        for rid in &lock_ids {
            if let Some(rs) = locked.get_mut(*rid) {
                rs.remove_event(id);
            }
        }
        for allocation in &allocations {
            if let Some(rs) = locked.get_mut(allocation.resource_id) {
                rs.insert_slot(Slot {
                    allocation_id: allocation.id,
                    event: event.clone(),
                });
            }
            self.index_allocation(*allocation);
        }
        event_guard.event = event.clone();
        info!(
            event_id = id,
            removed = old.len(),
            added = allocations.len(),
            "event updated"
        );
        Ok(event)
    }

    /// Delete an event and, in the same WAL record, all of its allocations.
    pub async fn delete_event(&self, id: EventId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let es = self
            .get_event_state(&id)
            .ok_or(EngineError::EventNotFound(id))?;
        let mut event_guard = es.write().await;
        if event_guard.deleted {
            return Err(EngineError::EventNotFound(id));
        }

        // Step 1: collect dependent allocations and lock their resources.
        let old = self.allocations_of_event(id);
        let lock_ids = sorted_union(old.iter().map(|a| a.resource_id), &[]);
        let mut locked = self.lock_resources(&lock_ids).await;
        let allocation_ids: Vec<Ulid> = old.iter().map(|a| a.id).collect();
        self.wal_append(&Change::EventDeleted {
            id,
            allocations: allocation_ids.clone(),
        })
        .await?;

        // Step 2: delete them, then the event.
        for allocation_id in &allocation_ids {
            self.unindex_allocation(allocation_id);
        }
        for rid in &lock_ids {
            if let Some(rs) = locked.get_mut(*rid) {
                rs.remove_event(id);
            }
        }
        self.event_allocations.remove(&id);
        event_guard.deleted = true;
        self.events.remove(&id);
        info!(event_id = id, cascaded = allocation_ids.len(), "event deleted");
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut changes = vec![Change::IdCounters {
            next_resource_id: self.next_resource_id.load(Ordering::SeqCst),
            next_event_id: self.next_event_id.load(Ordering::SeqCst),
        }];
        for id in self.resource_ids() {
            let Some(rs) = self.get_resource_state(&id) else {
                continue;
            };
            let guard = rs.read().await;
            changes.push(Change::ResourceCreated {
                resource: guard.resource.clone(),
            });
        }
        for id in self.event_ids() {
            let Some(es) = self.get_event_state(&id) else {
                continue;
            };
            let guard = es.read().await;
            changes.push(Change::EventCreated {
                event: guard.event.clone(),
                allocations: self.allocations_of_event(id),
            });
        }

        let count = changes.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} changes");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: &str, start: Ms, end: Ms, resource_ids: Vec<ResourceId>) -> EventDraft {
        EventDraft {
            title: title.into(),
            description: String::new(),
            start,
            end,
            resource_ids,
        }
    }

    #[test]
    fn draft_validation_sorts_and_dedups() {
        let valid = validate_draft(&draft(" Lab ", 0, 10, vec![3, 1, 3, 2])).unwrap();
        assert_eq!(valid.title, "Lab");
        assert_eq!(valid.resource_ids, vec![1, 2, 3]);
    }

    #[test]
    fn draft_validation_rejects_bad_window() {
        assert!(matches!(
            validate_draft(&draft("x", 10, 10, vec![])),
            Err(EngineError::InvalidTimeRange { .. })
        ));
        assert!(matches!(
            validate_draft(&draft("x", 10, 5, vec![])),
            Err(EngineError::InvalidTimeRange { .. })
        ));
    }

    #[test]
    fn draft_validation_checks_window_before_title() {
        assert!(matches!(
            validate_draft(&draft("", 10, 10, vec![])),
            Err(EngineError::InvalidTimeRange { .. })
        ));
        assert!(matches!(
            validate_draft(&draft("   ", 0, 10, vec![])),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn draft_validation_limits() {
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(
            validate_draft(&draft(&long, 0, 10, vec![])),
            Err(EngineError::LimitExceeded(_))
        ));
        let many: Vec<ResourceId> = (0..=MAX_RESOURCES_PER_EVENT as u64).collect();
        assert!(matches!(
            validate_draft(&draft("x", 0, 10, many)),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn resource_fields_required() {
        assert!(validate_resource_fields("  ", "room").is_err());
        assert!(validate_resource_fields("Room A", "").is_err());
        assert_eq!(
            validate_resource_fields(" Room A ", " room ").unwrap(),
            ("Room A".to_string(), "room".to_string())
        );
    }

    #[test]
    fn union_is_sorted_and_unique() {
        assert_eq!(sorted_union(vec![5, 1], &[3, 1, 7]), vec![1, 3, 5, 7]);
        assert!(sorted_union(Vec::new(), &[]).is_empty());
    }
}
