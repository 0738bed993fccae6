mod conflict;
mod error;
mod mutations;
mod queries;
mod report;
mod scan;
mod store;

pub use conflict::{check_conflicts, overlapping_events, validate_window};
pub use error::EngineError;
pub use queries::AllocationFilter;
pub use report::{build_report, round_hours, utilization_row};
pub use scan::{find_all_conflicts, overlapping_pairs, overlapping_pairs_quadratic, sort_for_scan};
pub use store::{AllocationStore, Snapshot};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedEventState = Arc<RwLock<EventState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Change, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (change, _) in batch {
        if let Err(e) = wal.append_buffered(change) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Change, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The allocation store: events, resources and the allocation relation,
/// with per-resource write locks serializing check-then-commit.
///
/// Lock order is always: commit gate → event → resources by ascending id.
pub struct Engine {
    resources: DashMap<ResourceId, SharedResourceState>,
    events: DashMap<EventId, SharedEventState>,
    /// allocation id → allocation row
    allocations: DashMap<Ulid, Allocation>,
    /// event id → ids of its allocations
    event_allocations: DashMap<EventId, Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared for their whole duration; compaction holds it
    /// exclusively so no committed change can slip between snapshot and swap.
    pub(super) commit_gate: RwLock<()>,
    next_resource_id: AtomicU64,
    next_event_id: AtomicU64,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            events: DashMap::new(),
            allocations: DashMap::new(),
            event_allocations: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            next_resource_id: AtomicU64::new(1),
            next_event_id: AtomicU64::new(1),
        };

        // We're the sole owner of every lock here, so try_read/try_write always
        // succeed. Never block: this may run inside an async context.
        for change in &changes {
            engine.replay_change(change);
        }
        if !changes.is_empty() {
            tracing::info!(
                "replayed {} changes: {} resources, {} events",
                changes.len(),
                engine.resources.len(),
                engine.events.len()
            );
        }

        Ok(engine)
    }

    fn replay_change(&self, change: &Change) {
        match change {
            Change::ResourceCreated { resource } => {
                self.next_resource_id.fetch_max(resource.id + 1, Ordering::SeqCst);
                self.resources.insert(
                    resource.id,
                    Arc::new(RwLock::new(ResourceState::new(resource.clone()))),
                );
            }
            Change::ResourceUpdated { resource } => {
                if let Some(rs) = self.get_resource_state(&resource.id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.resource = resource.clone();
                }
            }
            Change::ResourceDeleted { id, allocations } => {
                for allocation_id in allocations {
                    self.unindex_allocation(allocation_id);
                }
                self.resources.remove(id);
            }
            Change::EventCreated { event, allocations }
            | Change::EventUpdated { event, allocations } => {
                self.next_event_id.fetch_max(event.id + 1, Ordering::SeqCst);
                self.replay_detach_event(event.id);
                self.events.insert(
                    event.id,
                    Arc::new(RwLock::new(EventState {
                        event: event.clone(),
                        deleted: false,
                    })),
                );
                for allocation in allocations {
                    if let Some(rs) = self.get_resource_state(&allocation.resource_id) {
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        guard.insert_slot(Slot {
                            allocation_id: allocation.id,
                            event: event.clone(),
                        });
                        self.index_allocation(*allocation);
                    }
                }
            }
            Change::IdCounters {
                next_resource_id,
                next_event_id,
            } => {
                self.next_resource_id.fetch_max(*next_resource_id, Ordering::SeqCst);
                self.next_event_id.fetch_max(*next_event_id, Ordering::SeqCst);
            }
            Change::EventDeleted { id, allocations } => {
                self.replay_detach_event(*id);
                for allocation_id in allocations {
                    self.unindex_allocation(allocation_id);
                }
                self.event_allocations.remove(id);
                self.events.remove(id);
            }
        }
    }

    /// Drop every slot and allocation an event holds (replay only).
    fn replay_detach_event(&self, event_id: EventId) {
        for allocation in self.allocations_of_event(event_id) {
            self.unindex_allocation(&allocation.id);
            if let Some(rs) = self.get_resource_state(&allocation.resource_id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                guard.remove_event(event_id);
            }
        }
    }

    /// Write a change to the WAL via the background group-commit writer.
    async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource_state(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_event_state(&self, id: &EventId) -> Option<SharedEventState> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    // ── Allocation index ─────────────────────────────────────

    fn index_allocation(&self, allocation: Allocation) {
        self.allocations.insert(allocation.id, allocation);
        self.event_allocations
            .entry(allocation.event_id)
            .or_default()
            .push(allocation.id);
    }

    fn unindex_allocation(&self, id: &Ulid) -> Option<Allocation> {
        let (_, allocation) = self.allocations.remove(id)?;
        if let Some(mut ids) = self.event_allocations.get_mut(&allocation.event_id) {
            ids.retain(|a| a != id);
        }
        Some(allocation)
    }

    /// Current allocation rows of an event, in insertion order.
    pub(super) fn allocations_of_event(&self, event_id: EventId) -> Vec<Allocation> {
        let ids = self
            .event_allocations
            .get(&event_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.allocations.get(id).map(|a| *a.value()))
            .collect()
    }

    pub(super) fn all_allocations(&self) -> Vec<Allocation> {
        self.allocations.iter().map(|e| *e.value()).collect()
    }

    pub(super) fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub(super) fn event_ids(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.events.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn allocate_resource_id(&self) -> ResourceId {
        self.next_resource_id.fetch_add(1, Ordering::SeqCst)
    }

    fn allocate_event_id(&self) -> EventId {
        self.next_event_id.fetch_add(1, Ordering::SeqCst)
    }
}
