use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::StaffNotice;
use crate::observability::{RESERVATIONS_TOTAL, VISIT_TRANSITIONS_TOTAL};

use super::matcher::{find_conflict, find_smallest_available_table};
use super::policy::{now_ms, validate_duration, validate_party_size, validate_request};
use super::{Engine, EngineError};

fn require_hall_access(rs: &RestaurantState, actor: &Ulid) -> Result<(), EngineError> {
    if !rs.has_hall_access(actor) {
        return Err(EngineError::AccessDenied);
    }
    Ok(())
}

fn get_visit<'a>(rs: &'a RestaurantState, visit_id: &Ulid) -> Result<&'a Visit, EngineError> {
    rs.visits.get(visit_id).ok_or(EngineError::NotFound(*visit_id))
}

fn incorrect_status(visit: &Visit) -> EngineError {
    EngineError::IncorrectVisitStatus {
        visit_id: visit.id,
        status: visit.status(),
    }
}

fn record_outcome(result: &Result<VisitInfo, EngineError>) {
    let outcome = match result {
        Ok(_) => "created",
        Err(EngineError::Duplicate(_)) => "duplicate",
        Err(EngineError::NoAvailableTable) => "no_table",
        Err(EngineError::VisitTooShort { .. } | EngineError::VisitExceedsMaxTime { .. }) => "policy",
        Err(_) => "rejected",
    };
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Create a reservation for `requester`.
    ///
    /// The requester's lock is taken before the restaurant write lock, so the
    /// duplicate check, matching, the pre-commit re-check and the WAL append
    /// all observe the same state. Of two overlapping attempts on the same
    /// table at most one commits; the other sees `NoAvailableTable` or
    /// `Duplicate`.
    pub async fn create_reservation(
        &self,
        request: ReservationRequest,
        requester: Ulid,
    ) -> Result<VisitInfo, EngineError> {
        let result = self.create_reservation_inner(request, requester).await;
        record_outcome(&result);
        result
    }

    async fn create_reservation_inner(
        &self,
        request: ReservationRequest,
        requester: Ulid,
    ) -> Result<VisitInfo, EngineError> {
        let now = now_ms();
        validate_request(&request, now)?;
        if self.get_restaurant_for_visit(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }

        let requester_lock = self.requester_lock(requester);
        let _held = requester_lock.lock().await;

        let mut guard = self.restaurant_write(&request.restaurant_id).await?;
        if !guard.is_active() {
            return Err(EngineError::NotFound(request.restaurant_id));
        }
        validate_duration(&guard.settings, &request.window)?;
        if guard.visits.len() >= MAX_VISITS_PER_RESTAURANT {
            return Err(EngineError::LimitExceeded("too many visits"));
        }

        if let Some(existing) = self.index.overlapping_for_user(&requester, &request.window) {
            tracing::debug!(
                "reservation {} rejected: requester {requester} already holds {}",
                request.id,
                existing.visit_id
            );
            return Err(EngineError::Duplicate(existing.visit_id));
        }

        let table_id = if request.takeaway {
            None
        } else {
            let table = find_smallest_available_table(&guard, request.party_size, &request.window)
                .ok_or(EngineError::NoAvailableTable)?;
            // Race guard: the chosen table must still be free at commit time.
            if let Some(conflict) = find_conflict(&guard, table, &request.window, None) {
                tracing::warn!("table {} conflicts with {conflict} at commit", table.id);
                return Err(EngineError::NoAvailableTable);
            }
            Some(table.id)
        };

        let visit = Visit {
            id: request.id,
            restaurant_id: request.restaurant_id,
            table_id,
            creator_id: requester,
            party_size: request.party_size,
            takeaway: request.takeaway,
            planned: request.window,
            reservation: Some(Reservation {
                deposit: guard.settings.reservation_deposit,
                reserved_at: now,
                decision: Decision::Pending,
            }),
            started_at: None,
            ended_at: None,
            cancelled_at: None,
        };
        let info = VisitInfo::from(&visit);
        self.commit_new_visit(&mut guard, visit).await?;

        let targets = guard.on_duty_staff();
        drop(guard);

        tracing::info!(
            "reservation {} at restaurant {} table {:?} for {} guests",
            info.id,
            info.restaurant_id,
            info.table_id,
            info.party_size
        );
        self.notify_staff(targets, &info);
        Ok(info)
    }

    /// Seat a party now. Hall staff only.
    pub async fn create_walk_in(
        &self,
        request: WalkInRequest,
        actor: Ulid,
    ) -> Result<VisitInfo, EngineError> {
        validate_party_size(request.party_size)?;
        if self.get_restaurant_for_visit(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }

        let mut guard = self.restaurant_write(&request.restaurant_id).await?;
        if !guard.is_active() {
            return Err(EngineError::NotFound(request.restaurant_id));
        }
        require_hall_access(&guard, &actor)?;
        if guard.visits.len() >= MAX_VISITS_PER_RESTAURANT {
            return Err(EngineError::LimitExceeded("too many visits"));
        }

        let now = now_ms();
        let window = Span::new(now, now + guard.settings.max_duration_ms());
        let table_id = match (request.takeaway, request.table_id) {
            (true, _) => None,
            (false, Some(table_id)) => {
                let table = guard.active_table(table_id).ok_or(EngineError::TableNotFound {
                    restaurant_id: request.restaurant_id,
                    table_id,
                })?;
                if let Some(conflict) = find_conflict(&guard, table, &window, None) {
                    return Err(EngineError::TableNotAvailable { table_id, conflict });
                }
                Some(table_id)
            }
            (false, None) => Some(
                find_smallest_available_table(&guard, request.party_size, &window)
                    .ok_or(EngineError::NoAvailableTable)?
                    .id,
            ),
        };

        let visit = Visit {
            id: request.id,
            restaurant_id: request.restaurant_id,
            table_id,
            creator_id: actor,
            party_size: request.party_size,
            takeaway: request.takeaway,
            planned: window,
            reservation: None,
            started_at: Some(now),
            ended_at: None,
            cancelled_at: None,
        };
        let info = VisitInfo::from(&visit);
        self.commit_new_visit(&mut guard, visit).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "action" => "walk_in").increment(1);
        Ok(info)
    }

    /// Approve or decline a pending reservation. Declining frees the table.
    pub async fn decide_reservation(
        &self,
        visit_id: Ulid,
        actor: Ulid,
        approve: bool,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_visit_write(&visit_id).await?;
        require_hall_access(&guard, &actor)?;
        let visit = get_visit(&guard, &visit_id)?;
        if visit.status() != VisitStatus::Pending {
            return Err(incorrect_status(visit));
        }

        let at = now_ms();
        let decision = if approve {
            Decision::Approved { by: actor, at }
        } else {
            Decision::Declined { by: actor, at }
        };
        let event = Event::ReservationDecided {
            restaurant_id: guard.id,
            visit_id,
            decision,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let action = if approve { "approve" } else { "decline" };
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "action" => action).increment(1);
        Ok(())
    }

    pub async fn start_visit(&self, visit_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_visit_write(&visit_id).await?;
        require_hall_access(&guard, &actor)?;
        let visit = get_visit(&guard, &visit_id)?;
        if !matches!(visit.status(), VisitStatus::Pending | VisitStatus::Approved) {
            return Err(incorrect_status(visit));
        }

        let event = Event::VisitStarted {
            restaurant_id: guard.id,
            visit_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "action" => "start").increment(1);
        Ok(())
    }

    /// End a visit in progress. The table is free again from this instant.
    pub async fn end_visit(&self, visit_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_visit_write(&visit_id).await?;
        require_hall_access(&guard, &actor)?;
        let visit = get_visit(&guard, &visit_id)?;
        if visit.status() != VisitStatus::InProgress {
            return Err(incorrect_status(visit));
        }

        let event = Event::VisitEnded {
            restaurant_id: guard.id,
            visit_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "action" => "end").increment(1);
        Ok(())
    }

    /// Soft-cancel a visit that has not started. Allowed for its creator and
    /// for hall staff.
    pub async fn cancel_visit(&self, visit_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_visit_write(&visit_id).await?;
        let visit = get_visit(&guard, &visit_id)?;
        if visit.creator_id != actor && !guard.has_hall_access(&actor) {
            return Err(EngineError::AccessDenied);
        }
        if !matches!(visit.status(), VisitStatus::Pending | VisitStatus::Approved) {
            return Err(incorrect_status(visit));
        }

        let event = Event::VisitCancelled {
            restaurant_id: guard.id,
            visit_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "action" => "cancel").increment(1);
        Ok(())
    }

    /// Move a visit to another table.
    ///
    /// The window checked on the new table starts now for a visit in progress,
    /// or at the reserved start otherwise, and ends at the reserved end (or
    /// start + max duration for walk-ins).
    pub async fn reassign_table(
        &self,
        visit_id: Ulid,
        new_table_id: TableId,
        actor: Ulid,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_visit_write(&visit_id).await?;
        require_hall_access(&guard, &actor)?;
        let visit = get_visit(&guard, &visit_id)?;
        if !visit.is_live() {
            return Err(incorrect_status(visit));
        }

        let start = match (visit.started_at, &visit.reservation) {
            (Some(_), _) => now_ms(),
            (None, Some(_)) => visit.planned.start,
            (None, None) => return Err(EngineError::InvalidState(visit_id)),
        };
        let end = match visit.reservation {
            Some(_) => visit.planned.end,
            None => start + guard.settings.max_duration_ms(),
        };

        let table = guard.active_table(new_table_id).ok_or(EngineError::TableNotFound {
            restaurant_id: guard.id,
            table_id: new_table_id,
        })?;
        // A visit already past its reserved end holds nothing left to check.
        if start < end
            && let Some(conflict) = find_conflict(&guard, table, &Span::new(start, end), Some(visit_id))
        {
            return Err(EngineError::TableNotAvailable {
                table_id: new_table_id,
                conflict,
            });
        }

        let event = Event::TableReassigned {
            restaurant_id: guard.id,
            visit_id,
            table_id: new_table_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "action" => "reassign").increment(1);
        tracing::info!("visit {visit_id} moved to table {new_table_id}");
        Ok(())
    }

    /// Best effort; never part of the commit.
    fn notify_staff(&self, target_user_ids: Vec<Ulid>, visit: &VisitInfo) {
        if target_user_ids.is_empty() {
            tracing::debug!("no staff on duty for restaurant {}", visit.restaurant_id);
            return;
        }
        let delivered = self.notify.send(
            visit.restaurant_id,
            StaffNotice {
                restaurant_id: visit.restaurant_id,
                target_user_ids,
                visit: visit.clone(),
            },
        );
        tracing::debug!("staff notice for visit {} reached {delivered} listeners", visit.id);
    }
}
