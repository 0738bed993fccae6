use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "clashd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "clashd_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: event writes refused because of overlapping allocations.
pub const CONFLICTS_REJECTED_TOTAL: &str = "clashd_conflicts_rejected_total";

/// Counter: overlapping pairs found by full conflict scans.
pub const CONFLICTS_DETECTED_TOTAL: &str = "clashd_conflicts_detected_total";

/// Counter: writes retried after a concurrent resource delete.
pub const WRITE_RETRIES_TOTAL: &str = "clashd_write_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "clashd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "clashd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "clashd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clashd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clashd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::SelectResources => "select_resources",
        Command::SelectEvents => "select_events",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectConflictCheck { .. } => "select_conflict_check",
        Command::SelectConflicts => "select_conflicts",
        Command::SelectUtilization { .. } => "select_utilization",
    }
}
