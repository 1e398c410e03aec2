use ulid::Ulid;

use crate::model::*;

// ── Availability Matcher ──────────────────────────────────────────

/// Active tables that seat `party_size` and have no booking overlapping
/// `window`, ordered by `(capacity, table id)`.
pub fn available_tables<'a>(
    restaurant: &'a RestaurantState,
    party_size: u32,
    window: &Span,
) -> Vec<&'a TableState> {
    let mut free: Vec<&TableState> = restaurant
        .tables
        .values()
        .filter(|t| t.active && t.capacity >= party_size)
        .filter(|t| t.overlapping(window).next().is_none())
        .collect();
    free.sort_by_key(|t| (t.capacity, t.id));
    free
}

/// Smallest-capacity free table; ties go to the lowest table id.
pub fn find_smallest_available_table<'a>(
    restaurant: &'a RestaurantState,
    party_size: u32,
    window: &Span,
) -> Option<&'a TableState> {
    restaurant
        .tables
        .values()
        .filter(|t| t.active && t.capacity >= party_size)
        .filter(|t| t.overlapping(window).next().is_none())
        .min_by_key(|t| (t.capacity, t.id))
}

/// Returns the first booking on `table` that overlaps `window`, ignoring the
/// visit `except` and visits that have already ended.
pub(crate) fn find_conflict(
    restaurant: &RestaurantState,
    table: &TableState,
    window: &Span,
    except: Option<Ulid>,
) -> Option<Ulid> {
    table
        .overlapping(window)
        .filter(|b| Some(b.visit_id) != except)
        .find(|b| {
            restaurant
                .visits
                .get(&b.visit_id)
                .is_none_or(|v| v.is_live())
        })
        .map(|b| b.visit_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn restaurant(tables: &[(TableId, u32)]) -> RestaurantState {
        let mut rs = RestaurantState::new(
            Ulid::new(),
            Ulid::new(),
            "Trattoria".into(),
            RestaurantSettings {
                max_reservation_minutes: 180,
                reservation_deposit: None,
            },
        );
        rs.verified = true;
        for &(id, capacity) in tables {
            rs.tables.insert(id, TableState::new(id, capacity));
        }
        rs
    }

    fn book(rs: &mut RestaurantState, table_id: TableId, start: Ms, end: Ms) -> Ulid {
        let visit = Visit {
            id: Ulid::new(),
            restaurant_id: rs.id,
            table_id: Some(table_id),
            creator_id: Ulid::new(),
            party_size: 1,
            takeaway: false,
            planned: Span::new(start, end),
            reservation: None,
            started_at: None,
            ended_at: None,
            cancelled_at: None,
        };
        let id = visit.id;
        rs.visits.insert(id, visit);
        rs.sync_booking(id, None);
        id
    }

    #[test]
    fn skips_small_and_overlapping_tables() {
        // A: 2, B: 4, C: 6; B booked 18:00–19:00
        let mut rs = restaurant(&[(1, 2), (2, 4), (3, 6)]);
        book(&mut rs, 2, 18 * H, 19 * H);

        let window = Span::new(18 * H + 30 * M, 19 * H + 30 * M);
        let table = find_smallest_available_table(&rs, 3, &window).unwrap();
        assert_eq!(table.id, 3);
    }

    #[test]
    fn picks_smallest_sufficient_table() {
        let mut rs = restaurant(&[(1, 2), (2, 4), (3, 6)]);
        book(&mut rs, 2, 18 * H, 19 * H);

        let window = Span::new(17 * H, 18 * H);
        let table = find_smallest_available_table(&rs, 2, &window).unwrap();
        assert_eq!(table.id, 1);
    }

    #[test]
    fn adjacent_booking_does_not_block() {
        let mut rs = restaurant(&[(1, 4)]);
        book(&mut rs, 1, 18 * H, 19 * H);

        assert!(find_smallest_available_table(&rs, 2, &Span::new(19 * H, 20 * H)).is_some());
        assert!(find_smallest_available_table(&rs, 2, &Span::new(17 * H, 18 * H)).is_some());
        assert!(find_smallest_available_table(&rs, 2, &Span::new(17 * H, 18 * H + 1)).is_none());
    }

    #[test]
    fn tie_break_lowest_table_id() {
        let rs = restaurant(&[(9, 4), (4, 4), (7, 4)]);
        let table = find_smallest_available_table(&rs, 4, &Span::new(0, H)).unwrap();
        assert_eq!(table.id, 4);
    }

    #[test]
    fn inactive_tables_are_never_matched() {
        let mut rs = restaurant(&[(1, 2), (2, 4)]);
        rs.tables.get_mut(&1).unwrap().active = false;
        let table = find_smallest_available_table(&rs, 2, &Span::new(0, H)).unwrap();
        assert_eq!(table.id, 2);
    }

    #[test]
    fn none_when_every_table_is_too_small_or_busy() {
        let mut rs = restaurant(&[(1, 2), (2, 4)]);
        book(&mut rs, 2, 0, 2 * H);
        assert!(find_smallest_available_table(&rs, 3, &Span::new(H, 3 * H)).is_none());
        assert!(find_smallest_available_table(&rs, 5, &Span::new(5 * H, 6 * H)).is_none());
    }

    #[test]
    fn available_tables_ordered_by_capacity_then_id() {
        let mut rs = restaurant(&[(5, 6), (1, 4), (3, 4), (2, 2)]);
        book(&mut rs, 1, 0, H);
        let ids: Vec<TableId> = available_tables(&rs, 3, &Span::new(0, H))
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn matcher_result_never_violates_constraints() {
        let mut rs = restaurant(&[(1, 2), (2, 2), (3, 4), (4, 4), (5, 8)]);
        book(&mut rs, 1, 0, 2 * H);
        book(&mut rs, 3, H, 3 * H);
        book(&mut rs, 5, 2 * H, 4 * H);

        for party in 1..=9 {
            for start_h in 0..4 {
                let window = Span::new(start_h * H, start_h * H + 90 * M);
                let found = find_smallest_available_table(&rs, party, &window);
                let candidates = available_tables(&rs, party, &window);
                match found {
                    Some(t) => {
                        assert!(t.capacity >= party);
                        assert_eq!(t.overlapping(&window).count(), 0);
                        assert_eq!(candidates[0].id, t.id);
                    }
                    None => assert!(candidates.is_empty()),
                }
            }
        }
    }

    #[test]
    fn conflict_ignores_self_and_ended_visits() {
        let mut rs = restaurant(&[(1, 4)]);
        let first = book(&mut rs, 1, 0, 2 * H);
        let window = Span::new(H, 3 * H);

        assert_eq!(find_conflict(&rs, &rs.tables[&1], &window, None), Some(first));
        assert_eq!(find_conflict(&rs, &rs.tables[&1], &window, Some(first)), None);

        let v = rs.visits.get_mut(&first).unwrap();
        v.started_at = Some(0);
        v.ended_at = Some(90 * M);
        rs.sync_booking(first, Some(1));
        assert_eq!(find_conflict(&rs, &rs.tables[&1], &window, None), None);
    }
}
