use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::matcher::{available_tables, find_smallest_available_table};
use super::policy::{validate_party_size, validate_timestamps};
use super::{Engine, EngineError};

fn table_info(restaurant_id: Ulid, t: &TableState) -> TableInfo {
    TableInfo {
        restaurant_id,
        table_id: t.id,
        capacity: t.capacity,
    }
}

impl Engine {
    fn validate_match_query(party_size: u32, window: &Span) -> Result<(), EngineError> {
        validate_party_size(party_size)?;
        validate_timestamps(window.start, window.end)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        Ok(())
    }

    /// Read-only matcher entry point: the restaurant must be active.
    pub async fn find_available_table(
        &self,
        restaurant_id: Ulid,
        party_size: u32,
        window: Span,
    ) -> Result<Option<TableInfo>, EngineError> {
        Self::validate_match_query(party_size, &window)?;
        let rs = self
            .get_restaurant(&restaurant_id)
            .ok_or(EngineError::NotFound(restaurant_id))?;
        let guard = rs.read().await;
        if !guard.is_active() {
            return Err(EngineError::NotFound(restaurant_id));
        }
        Ok(find_smallest_available_table(&guard, party_size, &window)
            .map(|t| table_info(restaurant_id, t)))
    }

    /// Every free table for the window, best fit first.
    pub async fn list_available_tables(
        &self,
        restaurant_id: Ulid,
        party_size: u32,
        window: Span,
    ) -> Result<Vec<TableInfo>, EngineError> {
        Self::validate_match_query(party_size, &window)?;
        let rs = self
            .get_restaurant(&restaurant_id)
            .ok_or(EngineError::NotFound(restaurant_id))?;
        let guard = rs.read().await;
        if !guard.is_active() {
            return Err(EngineError::NotFound(restaurant_id));
        }
        Ok(available_tables(&guard, party_size, &window)
            .into_iter()
            .map(|t| table_info(restaurant_id, t))
            .collect())
    }

    pub async fn list_restaurants(&self) -> Vec<RestaurantInfo> {
        let restaurants: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(restaurants.len());
        for rs in restaurants {
            let guard = rs.read().await;
            out.push(RestaurantInfo {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                settings: guard.settings,
                active: guard.is_active(),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Active tables only.
    pub async fn list_tables(&self, restaurant_id: Ulid) -> Result<Vec<TableInfo>, EngineError> {
        let rs = self
            .get_restaurant(&restaurant_id)
            .ok_or(EngineError::NotFound(restaurant_id))?;
        let guard = rs.read().await;
        Ok(guard
            .tables
            .values()
            .filter(|t| t.active)
            .map(|t| table_info(restaurant_id, t))
            .collect())
    }

    pub async fn get_visit(&self, visit_id: Ulid) -> Result<VisitInfo, EngineError> {
        let restaurant_id = self
            .get_restaurant_for_visit(&visit_id)
            .ok_or(EngineError::NotFound(visit_id))?;
        let rs = self
            .get_restaurant(&restaurant_id)
            .ok_or(EngineError::NotFound(restaurant_id))?;
        let guard = rs.read().await;
        guard
            .visits
            .get(&visit_id)
            .map(VisitInfo::from)
            .ok_or(EngineError::NotFound(visit_id))
    }

    /// Visits of a restaurant, optionally only those planned to overlap `window`,
    /// ordered by planned start.
    pub async fn list_visits(
        &self,
        restaurant_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<VisitInfo>, EngineError> {
        let rs = self
            .get_restaurant(&restaurant_id)
            .ok_or(EngineError::NotFound(restaurant_id))?;
        let guard = rs.read().await;
        let mut visits: Vec<VisitInfo> = guard
            .visits
            .values()
            .filter(|v| window.is_none_or(|w| v.planned.overlaps(&w)))
            .map(VisitInfo::from)
            .collect();
        visits.sort_by_key(|v| (v.start, v.id));
        Ok(visits)
    }

    /// Live reservations created by `user_id`, across restaurants.
    pub fn list_user_reservations(&self, user_id: &Ulid) -> Vec<super::UserBooking> {
        let mut held = self
            .index
            .by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        held.sort_by_key(|b| b.span.start);
        held
    }
}
