use std::net::SocketAddr;

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: appointments created by reconciliation.
pub const APPOINTMENTS_CREATED_TOTAL: &str = "ticketsync_appointments_created_total";

/// Counter: appointments moved or retitled in place by reconciliation.
pub const APPOINTMENTS_UPDATED_TOTAL: &str = "ticketsync_appointments_updated_total";

/// Counter: appointments deleted by reconciliation, orphan sweeps and purges.
pub const APPOINTMENTS_DELETED_TOTAL: &str = "ticketsync_appointments_deleted_total";

/// Counter: matched tickets skipped because a time module had no value.
pub const TICKETS_SKIPPED_TOTAL: &str = "ticketsync_tickets_skipped_total";

/// Histogram: one rule's reconciliation pass in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "ticketsync_reconcile_duration_seconds";

// ── Scheduler ───────────────────────────────────────────────────

/// Histogram: whole tick duration in seconds.
pub const TICK_DURATION_SECONDS: &str = "ticketsync_tick_duration_seconds";

/// Counter: failed rule passes. Labels: kind.
pub const RULE_FAILURES_TOTAL: &str = "ticketsync_rule_failures_total";

/// Counter: rules a tick skipped because their previous pass was still running.
pub const RULES_SKIPPED_IN_FLIGHT_TOTAL: &str = "ticketsync_rules_skipped_in_flight_total";

// ── Feedback ────────────────────────────────────────────────────

/// Counter: appointment edits fed back into tickets. Labels: status.
pub const FEEDBACK_WRITES_TOTAL: &str = "ticketsync_feedback_writes_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "ticketsync_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "ticketsync_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
