//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Coordination-service RPC attempts
//! - Sorter write batching
//! - Checkpoint flushes
//! - Owner changes and operation transitions
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `changefeed_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions. Registry and exporter setup belong to
//! the host process, not this crate.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one attempt of a coordination-service RPC.
///
/// Incremented on every attempt, including retries, so the rate of this
/// counter minus the request rate approximates retry pressure.
pub fn record_kv_op(op: &'static str) {
    counter!("changefeed_kv_ops_total", "op" => op).increment(1);
}

/// Record a watch reopen after a stuck channel.
pub fn record_watch_reset(role: &str) {
    counter!("changefeed_kv_watch_resets_total", "role" => role.to_string()).increment(1);
}

/// Record a committed sorter write batch.
pub fn record_sorter_write(actor_id: u64, bytes: usize, duration: Duration) {
    let id = actor_id.to_string();
    histogram!("changefeed_sorter_write_bytes", "actor" => id.clone()).record(bytes as f64);
    histogram!("changefeed_sorter_write_duration_seconds", "actor" => id)
        .record(duration.as_secs_f64());
}

/// Record a scheduled compaction.
pub fn record_sorter_compaction(actor_id: u64) {
    counter!("changefeed_sorter_compactions_total", "actor" => actor_id.to_string()).increment(1);
}

/// Gauge for iterators currently handed out by one actor.
pub fn set_sorter_open_iterators(actor_id: u64, count: usize) {
    gauge!("changefeed_sorter_open_iterators", "actor" => actor_id.to_string())
        .set(count as f64);
}

/// Record a durable checkpoint flush.
pub fn record_checkpoint_flush(task: &str, points: usize, duration: Duration) {
    let task = task.to_string();
    counter!("changefeed_checkpoint_flushes_total", "task" => task.clone()).increment(1);
    counter!("changefeed_checkpoint_points_flushed_total", "task" => task.clone())
        .increment(points as u64);
    histogram!("changefeed_checkpoint_flush_duration_seconds", "task" => task)
        .record(duration.as_secs_f64());
}

/// Record a rejected (non-monotonic) checkpoint save.
pub fn record_checkpoint_save_rejected(task: &str) {
    counter!("changefeed_checkpoint_save_rejected_total", "task" => task.to_string())
        .increment(1);
}

/// Gauge for pending checkpoint snapshots awaiting flush.
pub fn set_checkpoint_pending_snapshots(task: &str, count: usize) {
    gauge!("changefeed_checkpoint_pending_snapshots", "task" => task.to_string())
        .set(count as f64);
}

/// Record an observed owner change on the agent.
pub fn record_owner_change(changefeed: &str) {
    counter!("changefeed_agent_owner_changes_total", "changefeed" => changefeed.to_string())
        .increment(1);
}

/// Record an operation state transition on the agent.
pub fn record_operation_transition(changefeed: &str, state: &'static str) {
    counter!(
        "changefeed_agent_operation_transitions_total",
        "changefeed" => changefeed.to_string(),
        "state" => state
    )
    .increment(1);
}

/// Record a message ignored because it came from a stale owner.
pub fn record_stale_owner_message(changefeed: &str) {
    counter!("changefeed_agent_stale_owner_messages_total", "changefeed" => changefeed.to_string())
        .increment(1);
}
