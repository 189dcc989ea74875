use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Gauge: hosts loaded in the engine.
pub const HOSTS_ACTIVE: &str = "slotbook_hosts_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

// ── Booking core ────────────────────────────────────────────────

/// Counter: committed booking transitions. Labels: transition.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "slotbook_bookings_committed_total";

/// Counter: create/reschedule attempts rejected because the interval was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

/// Counter: transactions retried after the required host set changed. Labels: operation.
pub const TRANSACTION_RETRIES_TOTAL: &str = "slotbook_transaction_retries_total";

/// Counter: slot computations that used stale calendar data.
pub const STALE_CALENDAR_READS_TOTAL: &str = "slotbook_stale_calendar_reads_total";

/// Gauge: calendar connections currently considered stale.
pub const STALE_CONNECTIONS: &str = "slotbook_stale_connections";

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
        Command::UpsertHost { .. } => "upsert_host",
        Command::InsertWorkingHours { .. } => "insert_working_hours",
        Command::DeleteWorkingHours { .. } => "delete_working_hours",
        Command::UpsertTemplate { .. } => "upsert_template",
        Command::InsertTemplateHost { .. } => "insert_template_host",
        Command::DeleteTemplateHost { .. } => "delete_template_host",
        Command::InsertConnection { .. } => "insert_connection",
        Command::PublishBusy { .. } => "publish_busy",
        Command::RecordSyncFailure { .. } => "record_sync_failure",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookingByToken { .. } => "select_booking",
        Command::SelectHostBookings { .. } => "select_host_bookings",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::SetArchived { .. } => "set_archived",
        Command::ArchiveAll { .. } => "archive_all",
        Command::SelectSyncHealth { .. } => "select_sync_health",
    }
}
