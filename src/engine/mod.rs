mod error;
mod matcher;
mod mutations;
mod policy;
mod queries;
mod reservations;

pub use error::EngineError;
pub use matcher::{available_tables, find_smallest_available_table};
pub use policy::{validate_duration, validate_request};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRestaurantState = Arc<RwLock<RestaurantState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
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
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// A reservation window held by a user, for the cross-restaurant duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBooking {
    pub visit_id: Ulid,
    pub restaurant_id: Ulid,
    pub span: Span,
}

/// Lookup tables maintained alongside the per-restaurant state.
#[derive(Default)]
pub(super) struct VisitIndex {
    /// visit id → restaurant id
    by_visit: DashMap<Ulid, Ulid>,
    /// user id → live reservations created by that user
    by_user: DashMap<Ulid, Vec<UserBooking>>,
}

impl VisitIndex {
    fn track(&self, visit: &Visit) {
        self.by_visit.insert(visit.id, visit.restaurant_id);
        if visit.reservation.is_some() && visit.is_live() {
            self.by_user.entry(visit.creator_id).or_default().push(UserBooking {
                visit_id: visit.id,
                restaurant_id: visit.restaurant_id,
                span: visit.planned,
            });
        }
    }

    /// Reserve a visit id for `restaurant_id`. False if the id is taken.
    fn claim(&self, visit_id: Ulid, restaurant_id: Ulid) -> bool {
        match self.by_visit.entry(visit_id) {
            Entry::Vacant(slot) => {
                slot.insert(restaurant_id);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn release(&self, creator_id: &Ulid, visit_id: Ulid) {
        if let Some(mut held) = self.by_user.get_mut(creator_id) {
            held.retain(|b| b.visit_id != visit_id);
        }
        self.by_user.remove_if(creator_id, |_, held| held.is_empty());
    }

    pub(super) fn overlapping_for_user(&self, user_id: &Ulid, span: &Span) -> Option<UserBooking> {
        self.by_user
            .get(user_id)
            .and_then(|held| held.iter().find(|b| b.span.overlaps(span)).copied())
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedRestaurantState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: VisitIndex,
    /// Serializes the duplicate check + commit per requester.
    requester_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Held by restaurant registration and by compaction, so a registration
    /// is never appended to a log that compaction is about to replace.
    registry_lock: Mutex<()>,
}

/// Apply an event directly to a RestaurantState. The caller holds its lock.
fn apply_to_restaurant(rs: &mut RestaurantState, event: &Event, index: &VisitIndex) {
    match event {
        Event::RestaurantVerified { .. } => rs.verified = true,
        Event::SettingsUpdated { settings, .. } => rs.settings = *settings,
        Event::RestaurantArchived { .. } => {
            rs.archived = true;
            for table in rs.tables.values_mut() {
                table.active = false;
            }
        }
        Event::EmployeeHired { user_id, hall_access, .. } => {
            rs.employees.insert(
                *user_id,
                Employment {
                    hall_access: *hall_access,
                    on_duty: false,
                },
            );
        }
        Event::EmployeeFired { user_id, .. } => {
            rs.employees.remove(user_id);
        }
        Event::DutyChanged { user_id, on_duty, .. } => {
            if let Some(employment) = rs.employees.get_mut(user_id) {
                employment.on_duty = *on_duty;
            }
        }
        Event::TableAdded { table_id, capacity, .. } => {
            rs.tables.insert(*table_id, TableState::new(*table_id, *capacity));
        }
        Event::TableCapacityChanged { table_id, capacity, .. } => {
            if let Some(table) = rs.tables.get_mut(table_id) {
                table.capacity = *capacity;
            }
        }
        Event::TableRemoved { table_id, .. } => {
            if let Some(table) = rs.tables.get_mut(table_id) {
                table.active = false;
            }
        }
        Event::VisitCreated { visit } => {
            index.track(visit);
            rs.visits.insert(visit.id, visit.clone());
            rs.sync_booking(visit.id, None);
        }
        Event::ReservationDecided { visit_id, decision, .. } => {
            let Some(visit) = rs.visits.get_mut(visit_id) else {
                return;
            };
            if let Some(reservation) = visit.reservation.as_mut() {
                reservation.decision = *decision;
            }
            let (creator, table) = (visit.creator_id, visit.table_id);
            if matches!(decision, Decision::Declined { .. }) {
                index.release(&creator, *visit_id);
            }
            rs.sync_booking(*visit_id, table);
        }
        Event::VisitStarted { visit_id, at, .. } => {
            if let Some(visit) = rs.visits.get_mut(visit_id) {
                visit.started_at = Some(*at);
            }
        }
        Event::VisitEnded { visit_id, at, .. } => {
            let Some(visit) = rs.visits.get_mut(visit_id) else {
                return;
            };
            visit.ended_at = Some(*at);
            let (creator, table) = (visit.creator_id, visit.table_id);
            index.release(&creator, *visit_id);
            rs.sync_booking(*visit_id, table);
        }
        Event::VisitCancelled { visit_id, at, .. } => {
            let Some(visit) = rs.visits.get_mut(visit_id) else {
                return;
            };
            visit.cancelled_at = Some(*at);
            let (creator, table) = (visit.creator_id, visit.table_id);
            index.release(&creator, *visit_id);
            rs.sync_booking(*visit_id, table);
        }
        Event::TableReassigned { visit_id, table_id, .. } => {
            let Some(visit) = rs.visits.get_mut(visit_id) else {
                return;
            };
            let previous = visit.table_id.replace(*table_id);
            rs.sync_booking(*visit_id, previous);
        }
        // RestaurantRegistered is handled at the DashMap level, not here
        Event::RestaurantRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            index: VisitIndex::default(),
            requester_locks: DashMap::new(),
            registry_lock: Mutex::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this may run inside an async context.
        for event in &events {
            match event {
                Event::RestaurantRegistered { id, owner_id, name, settings } => {
                    let rs = RestaurantState::new(*id, *owner_id, name.clone(), *settings);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    let Some(restaurant_id) = event_restaurant_id(other) else {
                        continue;
                    };
                    let Some(entry) = engine.state.get(&restaurant_id) else {
                        tracing::warn!("replay: event for unknown restaurant {restaurant_id}");
                        continue;
                    };
                    let rs_arc = entry.clone();
                    drop(entry);
                    match rs_arc.try_write() {
                        Ok(mut guard) => apply_to_restaurant(&mut guard, other, &engine.index),
                        Err(_) => {
                            return Err(io::Error::other("replay: restaurant state contended"));
                        }
                    }
                }
            }
        }

        tracing::info!(
            "engine loaded {} restaurants from {} WAL events",
            engine.state.len(),
            events.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_restaurant(&self, id: &Ulid) -> Option<SharedRestaurantState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_restaurant_for_visit(&self, visit_id: &Ulid) -> Option<Ulid> {
        self.index.by_visit.get(visit_id).map(|e| *e.value())
    }

    pub(super) fn requester_lock(&self, user_id: Ulid) -> Arc<Mutex<()>> {
        self.requester_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// WAL-append + apply in one call. The WAL write happens first, so a
    /// failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RestaurantState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_restaurant(rs, event, &self.index);
        Ok(())
    }

    /// Claim the visit id, then persist and apply its creation. A failed
    /// append gives the id back.
    pub(super) async fn commit_new_visit(
        &self,
        rs: &mut RestaurantState,
        visit: Visit,
    ) -> Result<(), EngineError> {
        let visit_id = visit.id;
        if !self.index.claim(visit_id, visit.restaurant_id) {
            return Err(EngineError::AlreadyExists(visit_id));
        }
        let result = self.persist_and_apply(rs, &Event::VisitCreated { visit }).await;
        if result.is_err() {
            self.index.by_visit.remove(&visit_id);
        }
        result
    }

    /// Lookup restaurant, acquire write lock.
    pub(super) async fn restaurant_write(
        &self,
        restaurant_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RestaurantState>, EngineError> {
        let rs = self
            .get_restaurant(restaurant_id)
            .ok_or(EngineError::NotFound(*restaurant_id))?;
        Ok(rs.write_owned().await)
    }

    /// Lookup visit → restaurant, acquire write lock.
    pub(super) async fn resolve_visit_write(
        &self,
        visit_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RestaurantState>, EngineError> {
        let restaurant_id = self
            .get_restaurant_for_visit(visit_id)
            .ok_or(EngineError::NotFound(*visit_id))?;
        self.restaurant_write(&restaurant_id).await
    }
}

/// Extract the restaurant id from an event (for non-Register events).
fn event_restaurant_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RestaurantVerified { id }
        | Event::SettingsUpdated { id, .. }
        | Event::RestaurantArchived { id } => Some(*id),
        Event::EmployeeHired { restaurant_id, .. }
        | Event::EmployeeFired { restaurant_id, .. }
        | Event::DutyChanged { restaurant_id, .. }
        | Event::TableAdded { restaurant_id, .. }
        | Event::TableCapacityChanged { restaurant_id, .. }
        | Event::TableRemoved { restaurant_id, .. }
        | Event::ReservationDecided { restaurant_id, .. }
        | Event::VisitStarted { restaurant_id, .. }
        | Event::VisitEnded { restaurant_id, .. }
        | Event::VisitCancelled { restaurant_id, .. }
        | Event::TableReassigned { restaurant_id, .. } => Some(*restaurant_id),
        Event::VisitCreated { visit } => Some(visit.restaurant_id),
        Event::RestaurantRegistered { .. } => None,
    }
}
