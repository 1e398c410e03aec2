use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Table identifier, unique within its restaurant.
pub type TableId = u32;

pub const MINUTE_MS: Ms = 60_000;

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

    /// Whole minutes, rounded down.
    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestaurantSettings {
    pub max_reservation_minutes: u32,
    /// Deposit in minor currency units, charged per reservation.
    pub reservation_deposit: Option<u64>,
}

impl RestaurantSettings {
    pub fn max_duration_ms(&self) -> Ms {
        self.max_reservation_minutes as Ms * MINUTE_MS
    }
}

/// One occupation of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub visit_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct TableState {
    pub id: TableId,
    pub capacity: u32,
    /// False once removed by the owner or archived with the restaurant.
    pub active: bool,
    /// Bookings sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl TableState {
    pub fn new(id: TableId, capacity: u32) -> Self {
        Self {
            id,
            capacity,
            active: true,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, visit_id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.visit_id == visit_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Pending,
    Approved { by: Ulid, at: Ms },
    Declined { by: Ulid, at: Ms },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub deposit: Option<u64>,
    pub reserved_at: Ms,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStatus {
    Pending,
    Approved,
    Declined,
    Cancelled,
    InProgress,
    Ended,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Pending => "pending",
            VisitStatus::Approved => "approved",
            VisitStatus::Declined => "declined",
            VisitStatus::Cancelled => "cancelled",
            VisitStatus::InProgress => "in_progress",
            VisitStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    /// `None` for takeaway.
    pub table_id: Option<TableId>,
    pub creator_id: Ulid,
    pub party_size: u32,
    pub takeaway: bool,
    /// Reserved window, or `[started_at, started_at + max duration)` for walk-ins.
    pub planned: Span,
    pub reservation: Option<Reservation>,
    pub started_at: Option<Ms>,
    pub ended_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
}

impl Visit {
    pub fn status(&self) -> VisitStatus {
        if self.cancelled_at.is_some() {
            return VisitStatus::Cancelled;
        }
        if self.ended_at.is_some() {
            return VisitStatus::Ended;
        }
        if self.started_at.is_some() {
            return VisitStatus::InProgress;
        }
        match self.reservation.as_ref().map(|r| r.decision) {
            Some(Decision::Declined { .. }) => VisitStatus::Declined,
            Some(Decision::Approved { .. }) | None => VisitStatus::Approved,
            Some(Decision::Pending) => VisitStatus::Pending,
        }
    }

    /// Neither cancelled, declined nor ended.
    pub fn is_live(&self) -> bool {
        !matches!(
            self.status(),
            VisitStatus::Cancelled | VisitStatus::Declined | VisitStatus::Ended
        )
    }

    /// The part of the table timeline this visit holds, if any.
    pub fn occupied_span(&self) -> Option<Span> {
        if self.table_id.is_none() {
            return None;
        }
        match self.status() {
            VisitStatus::Cancelled | VisitStatus::Declined => None,
            _ => match self.ended_at {
                Some(ended) if ended <= self.planned.start => None,
                Some(ended) => Some(Span::new(self.planned.start, ended.min(self.planned.end))),
                None => Some(self.planned),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employment {
    pub hall_access: bool,
    pub on_duty: bool,
}

#[derive(Debug, Clone)]
pub struct RestaurantState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub settings: RestaurantSettings,
    pub verified: bool,
    pub archived: bool,
    pub tables: BTreeMap<TableId, TableState>,
    pub employees: HashMap<Ulid, Employment>,
    pub visits: HashMap<Ulid, Visit>,
}

impl RestaurantState {
    pub fn new(id: Ulid, owner_id: Ulid, name: String, settings: RestaurantSettings) -> Self {
        Self {
            id,
            owner_id,
            name,
            settings,
            verified: false,
            archived: false,
            tables: BTreeMap::new(),
            employees: HashMap::new(),
            visits: HashMap::new(),
        }
    }

    /// Verified and not archived.
    pub fn is_active(&self) -> bool {
        self.verified && !self.archived
    }

    pub fn has_hall_access(&self, user_id: &Ulid) -> bool {
        *user_id == self.owner_id
            || self.employees.get(user_id).is_some_and(|e| e.hall_access)
    }

    /// Hall staff currently on duty.
    pub fn on_duty_staff(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .employees
            .iter()
            .filter(|(_, e)| e.hall_access && e.on_duty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn active_table(&self, table_id: TableId) -> Option<&TableState> {
        self.tables.get(&table_id).filter(|t| t.active)
    }

    /// Drop the visit's booking from `previous_table` and re-insert it from the
    /// visit's current state.
    pub fn sync_booking(&mut self, visit_id: Ulid, previous_table: Option<TableId>) {
        if let Some(tid) = previous_table
            && let Some(table) = self.tables.get_mut(&tid)
        {
            table.remove_booking(visit_id);
        }
        let Some(visit) = self.visits.get(&visit_id) else {
            return;
        };
        if let (Some(tid), Some(span)) = (visit.table_id, visit.occupied_span())
            && let Some(table) = self.tables.get_mut(&tid)
        {
            table.insert_booking(Booking { visit_id, span });
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RestaurantRegistered {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        settings: RestaurantSettings,
    },
    RestaurantVerified {
        id: Ulid,
    },
    SettingsUpdated {
        id: Ulid,
        settings: RestaurantSettings,
    },
    RestaurantArchived {
        id: Ulid,
    },
    EmployeeHired {
        restaurant_id: Ulid,
        user_id: Ulid,
        hall_access: bool,
    },
    EmployeeFired {
        restaurant_id: Ulid,
        user_id: Ulid,
    },
    DutyChanged {
        restaurant_id: Ulid,
        user_id: Ulid,
        on_duty: bool,
    },
    TableAdded {
        restaurant_id: Ulid,
        table_id: TableId,
        capacity: u32,
    },
    TableCapacityChanged {
        restaurant_id: Ulid,
        table_id: TableId,
        capacity: u32,
    },
    TableRemoved {
        restaurant_id: Ulid,
        table_id: TableId,
    },
    /// Carries the full visit so compaction can write one record per visit.
    VisitCreated {
        visit: Visit,
    },
    ReservationDecided {
        restaurant_id: Ulid,
        visit_id: Ulid,
        decision: Decision,
    },
    VisitStarted {
        restaurant_id: Ulid,
        visit_id: Ulid,
        at: Ms,
    },
    VisitEnded {
        restaurant_id: Ulid,
        visit_id: Ulid,
        at: Ms,
    },
    VisitCancelled {
        restaurant_id: Ulid,
        visit_id: Ulid,
        at: Ms,
    },
    TableReassigned {
        restaurant_id: Ulid,
        visit_id: Ulid,
        table_id: TableId,
    },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub party_size: u32,
    pub window: Span,
    pub takeaway: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkInRequest {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub party_size: u32,
    /// Seat at this table instead of letting the matcher pick one.
    pub table_id: Option<TableId>,
    pub takeaway: bool,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestaurantInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub settings: RestaurantSettings,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub restaurant_id: Ulid,
    pub table_id: TableId,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitInfo {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub table_id: Option<TableId>,
    pub creator_id: Ulid,
    pub party_size: u32,
    pub takeaway: bool,
    pub start: Ms,
    pub end: Ms,
    pub deposit: Option<u64>,
    pub status: VisitStatus,
}

impl From<&Visit> for VisitInfo {
    fn from(v: &Visit) -> Self {
        Self {
            id: v.id,
            restaurant_id: v.restaurant_id,
            table_id: v.table_id,
            creator_id: v.creator_id,
            party_size: v.party_size,
            takeaway: v.takeaway,
            start: v.planned.start,
            end: v.planned.end,
            deposit: v.reservation.as_ref().and_then(|r| r.deposit),
            status: v.status(),
        }
    }
}
