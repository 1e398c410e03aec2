use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tablebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tablebook_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "tablebook_reservations_total";

/// Counter: visit lifecycle transitions. Labels: action.
pub const VISIT_TRANSITIONS_TOTAL: &str = "tablebook_visit_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tablebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tablebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tablebook_connections_rejected_total";

/// Counter: connections whose user name is not a valid ULID.
pub const AUTH_FAILURES_TOTAL: &str = "tablebook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablebook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "tablebook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRestaurant { .. } => "insert_restaurant",
        Command::UpdateSettings { .. } => "update_settings",
        Command::VerifyRestaurant { .. } => "verify_restaurant",
        Command::DeleteRestaurant { .. } => "delete_restaurant",
        Command::InsertTable { .. } => "insert_table",
        Command::UpdateTableCapacity { .. } => "update_table_capacity",
        Command::DeleteTable { .. } => "delete_table",
        Command::InsertEmployee { .. } => "insert_employee",
        Command::SetOnDuty { .. } => "set_on_duty",
        Command::DeleteEmployee { .. } => "delete_employee",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertWalkIn { .. } => "insert_walk_in",
        Command::TransitionVisit { .. } => "transition_visit",
        Command::ReassignTable { .. } => "reassign_table",
        Command::CancelVisit { .. } => "cancel_visit",
        Command::SelectAvailableTables { .. } => "select_available_tables",
        Command::SelectRestaurants => "select_restaurants",
        Command::SelectTables { .. } => "select_tables",
        Command::SelectVisits { .. } => "select_visits",
        Command::SelectVisit { .. } => "select_visit",
        Command::SelectUserReservations { .. } => "select_user_reservations",
    }
}
