//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Cycle execution and coalescing
//! - Push/pull batch sizes and durations
//! - Retry scheduling
//! - Error kinds
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions (durations, sizes). Every metric carries
//! the replication `identifier` label so channels can be told apart.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the start of one push-then-pull cycle.
pub fn record_cycle(identifier: &str) {
    counter!("replication_cycles_total", "identifier" => identifier.to_string()).increment(1);
}

/// Record a completed push batch.
pub fn record_push_batch(identifier: &str, size: usize, duration: Duration) {
    counter!("replication_push_batches_total", "identifier" => identifier.to_string()).increment(1);
    counter!("replication_documents_sent_total", "identifier" => identifier.to_string())
        .increment(size as u64);
    histogram!("replication_push_duration_seconds", "identifier" => identifier.to_string())
        .record(duration.as_secs_f64());
}

/// Record a completed pull batch.
pub fn record_pull_batch(identifier: &str, size: usize, duration: Duration) {
    counter!("replication_pull_batches_total", "identifier" => identifier.to_string()).increment(1);
    counter!("replication_documents_received_total", "identifier" => identifier.to_string())
        .increment(size as u64);
    histogram!("replication_pull_duration_seconds", "identifier" => identifier.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retry scheduled after a failed cycle phase.
pub fn record_retry_scheduled(identifier: &str, phase: &'static str) {
    counter!(
        "replication_retries_scheduled_total",
        "identifier" => identifier.to_string(),
        "phase" => phase
    )
    .increment(1);
}

/// Record an error emitted on the error stream.
pub fn record_replication_error(identifier: &str, kind: &'static str) {
    counter!(
        "replication_errors_total",
        "identifier" => identifier.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a checkpoint write (`kind` is `"push"` or `"pull"`).
pub fn record_checkpoint_write(identifier: &str, kind: &'static str) {
    counter!(
        "replication_checkpoint_writes_total",
        "identifier" => identifier.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Set the active gauge (1.0 while a cycle is executing).
pub fn set_replication_active(identifier: &str, active: bool) {
    gauge!("replication_active", "identifier" => identifier.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

/// Record a run request coalesced away because the queue was full.
pub fn record_run_coalesced(identifier: &str) {
    counter!("replication_runs_coalesced_total", "identifier" => identifier.to_string())
        .increment(1);
}
