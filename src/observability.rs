use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::BuildError;

use crate::engine::SaveReport;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: engine operations committed or failed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "recurra_operations_total";

/// Histogram: operation latency in seconds, including retries. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "recurra_operation_duration_seconds";

/// Counter: optimistic commits that lost the race and were retried.
pub const COMMIT_CONFLICTS_TOTAL: &str = "recurra_commit_conflicts_total";

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: generator saves, cascaded sibling saves included.
pub const GENERATOR_SAVES_TOTAL: &str = "recurra_generator_saves_total";

/// Counter: sibling saves triggered by a cascade.
pub const CASCADE_SAVES_TOTAL: &str = "recurra_cascade_saves_total";

/// Counter: occurrences materialized by sync.
pub const OCCURRENCES_CREATED_TOTAL: &str = "recurra_occurrences_created_total";

/// Counter: occurrences detached from their generator.
pub const OCCURRENCES_UNHOOKED_TOTAL: &str = "recurra_occurrences_unhooked_total";

/// Counter: occurrences moved along with their generator.
pub const OCCURRENCES_SHIFTED_TOTAL: &str = "recurra_occurrences_shifted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: events currently loaded.
pub const EVENTS_ACTIVE: &str = "recurra_events_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "recurra_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "recurra_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn record_operation(op: &'static str, ok: bool, elapsed: Duration) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op).record(elapsed.as_secs_f64());
}

/// Fold one committed save (and its cascade) into the reconciliation counters.
pub fn record_save(report: &SaveReport) {
    let siblings = report.siblings.len() as u64;
    metrics::counter!(GENERATOR_SAVES_TOTAL).increment(1 + siblings);
    metrics::counter!(CASCADE_SAVES_TOTAL).increment(siblings);
    metrics::counter!(OCCURRENCES_CREATED_TOTAL).increment(report.created() as u64);
    metrics::counter!(OCCURRENCES_UNHOOKED_TOTAL).increment(report.unhooked() as u64);
    metrics::counter!(OCCURRENCES_SHIFTED_TOTAL).increment(report.shifted as u64);
}
