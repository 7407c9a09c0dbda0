//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Broker connection and channel pool health
//! - Publish outcomes and latency
//! - Sink queue depth and drops
//! - Consumer outcomes
//! - Bulk ingestion throughput and failures
//! - Journal, replay and retention activity
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `pipeline_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by the crate; without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use log_pipeline::metrics;
//! use std::time::Duration;
//!
//! metrics::record_publish("central-logs-exchange", "success", 1, Duration::from_millis(3));
//! metrics::record_bulk_request("billing", 250, true, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Connection / Channel Pool
// =============================================================================

/// Record one connect attempt against the broker.
pub fn record_connection_attempt(endpoint: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "pipeline_connection_attempts_total",
        "endpoint" => endpoint.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record an unexpected connection shutdown.
pub fn record_connection_lost(endpoint: &str) {
    counter!("pipeline_connection_lost_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// 1 while a connection is open, 0 otherwise.
pub fn set_connection_open(open: bool) {
    gauge!("pipeline_connection_open").set(if open { 1.0 } else { 0.0 });
}

/// Record a channel freshly opened by the pool.
pub fn record_channel_created() {
    counter!("pipeline_channels_created_total").increment(1);
}

/// Record channels discarded by a pool purge.
pub fn record_channels_purged(count: usize) {
    counter!("pipeline_channels_purged_total").increment(count as u64);
}

/// Idle channels currently held by the pool.
pub fn set_pool_idle(idle: usize) {
    gauge!("pipeline_pool_idle_channels").set(idle as f64);
}

// =============================================================================
// Publish
// =============================================================================

/// Record a finished publish (`success`, `unroutable`, `failed`, `shutdown`).
pub fn record_publish(exchange: &str, outcome: &str, attempts: u32, duration: Duration) {
    let exchange = exchange.to_string();
    counter!(
        "pipeline_publish_total",
        "exchange" => exchange.clone(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    if attempts > 1 {
        counter!("pipeline_publish_retries_total", "exchange" => exchange.clone())
            .increment(u64::from(attempts - 1));
    }
    histogram!("pipeline_publish_duration_seconds", "exchange" => exchange)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Sinks
// =============================================================================

/// Record a write against a bounded sink (`accepted`, `dropped_oldest`, `dropped_newest`, `closed`).
pub fn record_sink_write(sink: &str, outcome: &str) {
    counter!(
        "pipeline_sink_writes_total",
        "sink" => sink.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Items waiting in a sink queue.
pub fn set_sink_queue_depth(sink: &str, depth: usize) {
    gauge!("pipeline_sink_queue_depth", "sink" => sink.to_string()).set(depth as f64);
}

/// Record an item that failed in a sink and went to `target`
/// (`fallback` or `last_resort`).
pub fn record_sink_fallback(sink: &str, target: &str) {
    counter!(
        "pipeline_sink_fallbacks_total",
        "sink" => sink.to_string(),
        "target" => target.to_string()
    )
    .increment(1);
}

// =============================================================================
// Consumers
// =============================================================================

/// Record one processed delivery and how it was settled.
pub fn record_consume(queue: &str, outcome: &str, duration: Duration) {
    let queue = queue.to_string();
    counter!(
        "pipeline_consume_total",
        "queue" => queue.clone(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("pipeline_consume_duration_seconds", "queue" => queue).record(duration.as_secs_f64());
}

/// Record a consumer loop re-subscribing after its stream ended.
pub fn record_consumer_resubscribe(queue: &str) {
    counter!("pipeline_consumer_resubscribes_total", "queue" => queue.to_string()).increment(1);
}

// =============================================================================
// Warehouses / Ingestion
// =============================================================================

/// Entries currently held by a warehouse.
pub fn set_warehouse_depth(warehouse: &str, depth: usize) {
    gauge!("pipeline_warehouse_depth", "warehouse" => warehouse.to_string()).set(depth as f64);
}

/// Record one ingestion flush across all stream groups.
pub fn record_ingest_flush(events: usize, groups: usize, failed: usize, duration: Duration) {
    counter!("pipeline_ingest_flushes_total").increment(1);
    counter!("pipeline_ingest_events_total").increment(events as u64);
    if failed > 0 {
        counter!("pipeline_ingest_failed_total").increment(failed as u64);
    }
    histogram!("pipeline_ingest_groups").record(groups as f64);
    histogram!("pipeline_ingest_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record one bulk request against the store.
pub fn record_bulk_request(stream_key: &str, documents: usize, success: bool, duration: Duration) {
    let key = stream_key.to_string();
    let status = if success { "success" } else { "failure" };
    counter!("pipeline_bulk_requests_total", "stream" => key.clone(), "status" => status).increment(1);
    histogram!("pipeline_bulk_request_documents", "stream" => key.clone()).record(documents as f64);
    histogram!("pipeline_bulk_request_duration_seconds", "stream" => key).record(duration.as_secs_f64());
}

/// Record documents diverted to the failure warehouse (`item`, `chunk`, `group`).
pub fn record_bulk_failures(stream_key: &str, scope: &str, count: usize) {
    counter!(
        "pipeline_bulk_failed_documents_total",
        "stream" => stream_key.to_string(),
        "scope" => scope.to_string()
    )
    .increment(count as u64);
}

/// Current chunk size chosen for a stream.
pub fn set_chunk_size(stream_key: &str, chunk_size: usize) {
    gauge!("pipeline_bulk_chunk_size", "stream" => stream_key.to_string()).set(chunk_size as f64);
}

// =============================================================================
// Journal / Replay / Retention
// =============================================================================

/// Record lines appended to a journal.
pub fn record_journal_write(journal: &str, lines: usize) {
    counter!("pipeline_journal_lines_total", "journal" => journal.to_string()).increment(lines as u64);
}

/// Record the outcome of replaying one journal file.
pub fn record_replay_file(journal: &str, replayed: usize, failed: usize) {
    let journal = journal.to_string();
    counter!("pipeline_replay_files_total", "journal" => journal.clone()).increment(1);
    counter!("pipeline_replay_lines_total", "journal" => journal.clone(), "status" => "success")
        .increment(replayed as u64);
    if failed > 0 {
        counter!("pipeline_replay_lines_total", "journal" => journal, "status" => "failure")
            .increment(failed as u64);
    }
}

/// Record a skipped replay candidate (`active`, `oversized`).
pub fn record_replay_skipped(journal: &str, reason: &str) {
    counter!(
        "pipeline_replay_skipped_total",
        "journal" => journal.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record buckets removed by the retention sweep.
pub fn record_retention_deleted(journal: &str, buckets: usize) {
    counter!("pipeline_retention_deleted_total", "journal" => journal.to_string())
        .increment(buckets as u64);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Gauge for pipeline state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("pipeline_engine_state").set(value);
}

/// Record an error by stage and kind.
pub fn record_error(stage: &str, error_type: &str) {
    counter!(
        "pipeline_errors_total",
        "stage" => stage.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "pipeline_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "pipeline_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state and no recorder is installed here,
    // so these only check that recording never panics.

    #[test]
    fn test_connection_metrics() {
        record_connection_attempt("amqp://localhost:5672/%2f", true);
        record_connection_attempt("amqp://localhost:5672/%2f", false);
        record_connection_lost("amqp://localhost:5672/%2f");
        set_connection_open(true);
        set_connection_open(false);
        record_channel_created();
        record_channels_purged(0);
        record_channels_purged(12);
        set_pool_idle(3);
    }

    #[test]
    fn test_publish_metrics() {
        record_publish("central-logs-exchange", "success", 1, Duration::from_millis(2));
        record_publish("central-logs-exchange", "failed", 6, Duration::from_secs(1));
        record_publish("", "unroutable", 0, Duration::ZERO);
    }

    #[test]
    fn test_sink_metrics() {
        record_sink_write("central", "accepted");
        record_sink_write("central", "dropped_oldest");
        set_sink_queue_depth("file", 0);
        record_sink_fallback("central", "fallback");
        record_sink_fallback("central", "last_resort");
    }

    #[test]
    fn test_ingest_metrics() {
        set_warehouse_depth("log_events", 1000);
        record_ingest_flush(0, 0, 0, Duration::ZERO);
        record_ingest_flush(1500, 3, 10, Duration::from_millis(120));
        record_bulk_request("billing", 250, true, Duration::from_millis(40));
        record_bulk_failures("billing", "chunk", 250);
        set_chunk_size("billing", 4000);
    }

    #[test]
    fn test_journal_metrics() {
        record_journal_write("failed_logs", 42);
        record_replay_file("failed_logs", 40, 2);
        record_replay_file("failed_logs", 0, 0);
        record_replay_skipped("failed_logs", "active");
        record_retention_deleted("failed_documents", 1);
    }

    #[test]
    fn test_engine_state_values() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "Bogus"] {
            set_engine_state(state);
        }
        record_error("ingest", "store");
    }

    #[test]
    fn test_circuit_metrics() {
        record_circuit_call("store_bulk", "success");
        record_circuit_rejection("store_bulk");
    }
}
