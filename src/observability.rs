use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "carbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "carbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "carbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "carbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "carbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "carbook_wal_compactions_total";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "carbook_reservations_created_total";

/// Counter: creates rejected because the window was already held.
pub const SCHEDULING_CONFLICTS_TOTAL: &str = "carbook_scheduling_conflicts_total";

/// Counter: applied status transitions. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "carbook_status_transitions_total";

/// Counter: transitions lost to a concurrent writer.
pub const STALE_STATE_TOTAL: &str = "carbook_stale_state_total";

/// Gauge: cars in the fleet.
pub const FLEET_SIZE: &str = "carbook_fleet_size";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notifications delivered. Labels: kind.
pub const NOTIFICATIONS_DISPATCHED_TOTAL: &str = "carbook_notifications_dispatched_total";

/// Counter: notifications that errored or timed out. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "carbook_notifications_failed_total";

/// Counter: notifications dropped on a full or closed outbox. Labels: kind.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "carbook_notifications_dropped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| io::Error::other(format!("failed to install Prometheus exporter: {e}")))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCar { .. } => "insert_car",
        Command::UpdateCar { .. } => "update_car",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectCars(_) => "select_cars",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectAvailableCars { .. } => "select_available_cars",
        Command::SelectQuote { .. } => "select_quote",
        Command::SelectSalesSummary { .. } => "select_sales_summary",
        Command::SelectMonthlySummary { .. } => "select_monthly_summary",
        Command::SelectCarPerformance { .. } => "select_car_performance",
    }
}
