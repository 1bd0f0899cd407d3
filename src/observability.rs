use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "pairbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "pairbook_query_duration_seconds";

/// Counter: meetings successfully booked.
pub const MEETINGS_BOOKED_TOTAL: &str = "pairbook_meetings_booked_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "pairbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "pairbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "pairbook_connections_rejected_total";

/// Counter: units of work committed to the WAL.
pub const COMMITS_TOTAL: &str = "pairbook_commits_total";

/// Counter: lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "pairbook_lock_timeouts_total";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "pairbook_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "pairbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "pairbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::RegisterPerson { .. } => "register_person",
        Command::ListPeople => "list_people",
        Command::SetAvailability { .. } => "set_availability",
        Command::GetAvailability { .. } => "get_availability",
        Command::FindOverlap { .. } => "find_overlap",
        Command::ScheduleMeeting { .. } => "schedule_meeting",
        Command::ListMeetings { .. } => "list_meetings",
    }
}
