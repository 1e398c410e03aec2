use crate::model::Ms;

/// Shortest visit anyone may reserve.
pub const MIN_VISIT_MINUTES: i64 = 30;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Upper bound for a restaurant's configured max visit duration (one day).
pub const MAX_RESERVATION_MINUTES_CAP: u32 = 24 * 60;

pub const MAX_RESTAURANTS: usize = 100_000;
pub const MAX_TABLES_PER_RESTAURANT: usize = 1_000;
pub const MAX_VISITS_PER_RESTAURANT: usize = 1_000_000;
pub const MAX_EMPLOYEES_PER_RESTAURANT: usize = 1_000;
pub const MAX_TABLE_CAPACITY: u32 = 100;
pub const MAX_PARTY_SIZE: u32 = 100;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
