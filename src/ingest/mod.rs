//! Adaptive batch ingestion into the search store.
//!
//! # Flush cycle
//!
//! ```text
//! Warehouse<LogEvent> ──tick──▶ FlushTrigger ──▶ drain
//!                                                  │ stable sort by timestamp
//!                                                  │ group by stream key
//!                   ┌──────────────────────────────┼──────────────────────────┐
//!                   ▼                              ▼                          ▼
//!               group "a"                      group "b"          ...  (bulkhead-limited)
//!                   │ sample one document's size
//!                   │ chunk = budget / running average
//!                   ▼
//!            bulk(chunk 1) … bulk(chunk n)   via circuit breaker
//!                   │
//!                   └─ failed item / chunk / group ──▶ Warehouse<FailedDocument>
//! ```
//!
//! Every event drained in a cycle ends up either written to the store or in
//! the failure warehouse; nothing is dropped.

pub mod elastic;
pub mod stats;
pub mod store;

use crate::batch::{FlushReport, FlushTrigger};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{IngestConfig, StoreConfig};
use crate::document::{FailedDocument, LogDocument};
use crate::error::{PipelineError, Result};
use crate::event::LogEvent;
use crate::metrics;
use crate::resilience::{self, Bulkhead};
use crate::warehouse::Warehouse;
use chrono::{DateTime, Utc};
use stats::{chunk_size, SizeRegistry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{BulkOperation, BulkRequest, BulkStore};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Daily index for a stream: `{key}-logs-{yyyy-mm-dd}`, lower-cased.
pub fn index_name(stream_key: &str, at: DateTime<Utc>) -> String {
    format!("{}-logs-{}", stream_key.to_lowercase(), at.format("%Y-%m-%d"))
}

/// Drains received events and bulk-writes them, one group per stream.
#[derive(Clone)]
pub struct IngestEngine {
    warehouse: Arc<Warehouse<LogEvent>>,
    failed: Arc<Warehouse<FailedDocument>>,
    store: Arc<dyn BulkStore>,
    circuit: Arc<CircuitBreaker>,
    sizes: Arc<SizeRegistry>,
    bulkhead: Bulkhead,
    budget_bytes: usize,
    config: IngestConfig,
}

impl IngestEngine {
    pub fn new(
        warehouse: Arc<Warehouse<LogEvent>>,
        failed: Arc<Warehouse<FailedDocument>>,
        store: Arc<dyn BulkStore>,
        config: &IngestConfig,
        store_config: &StoreConfig,
    ) -> Self {
        Self {
            warehouse,
            failed,
            store,
            circuit: Arc::new(CircuitBreaker::new("store", store_config.circuit_config())),
            sizes: Arc::new(SizeRegistry::new()),
            bulkhead: Bulkhead::new(config.parallelism),
            budget_bytes: store_config.request_budget_bytes.max(1),
            config: config.clone(),
        }
    }

    pub fn warehouse(&self) -> &Arc<Warehouse<LogEvent>> {
        &self.warehouse
    }

    pub fn sizes(&self) -> &SizeRegistry {
        &self.sizes
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Drain the warehouse and ingest everything in it.
    pub async fn flush(&self) -> FlushReport {
        let started = Instant::now();
        let Some(mut events) = self.warehouse.drain() else {
            debug!("Flush already in progress");
            return FlushReport::default();
        };
        if events.is_empty() {
            return FlushReport::default();
        }

        events.sort_by_key(|e| e.timestamp);
        let mut groups: BTreeMap<String, Vec<LogEvent>> = BTreeMap::new();
        for event in events {
            groups.entry(event.log_key.clone()).or_default().push(event);
        }

        let now = Utc::now();
        let mut tasks = JoinSet::new();
        for (stream_key, group) in groups {
            let engine = self.clone();
            tasks.spawn(
                async move {
                    let _slot = engine.bulkhead.enter().await;
                    engine.ingest_group(&stream_key, group, now).await
                }
                .instrument(info_span!("ingest_group")),
            );
        }

        let mut report = FlushReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(group) => report.merge(&group),
                Err(e) => error!(error = %e, "Ingest group task aborted"),
            }
        }

        metrics::record_ingest_flush(report.total, report.groups, report.failed, started.elapsed());
        if report.failed > 0 {
            warn!(total = report.total, failed = report.failed, groups = report.groups, "Ingest flush had failures");
        } else {
            debug!(total = report.total, groups = report.groups, "Ingest flush complete");
        }
        report
    }

    async fn ingest_group(&self, stream_key: &str, events: Vec<LogEvent>, now: DateTime<Utc>) -> FlushReport {
        let index = index_name(stream_key, now);
        let documents: Vec<LogDocument> = events.iter().map(LogDocument::from_event).collect();
        let total = documents.len();
        let mut report = FlushReport {
            total,
            groups: 1,
            ..FlushReport::default()
        };

        let chunk = match self.plan_chunk(stream_key, &documents) {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(stream_key, error = %e, documents = total, "Group failed before any chunk, routing to failure warehouse");
                metrics::record_bulk_failures(stream_key, "group", total);
                self.fail_all(&index, documents);
                report.failed = total;
                return report;
            }
        };

        let mut documents = documents.into_iter().peekable();
        while documents.peek().is_some() {
            let batch: Vec<LogDocument> = documents.by_ref().take(chunk).collect();
            let (succeeded, failed) = self.write_chunk(stream_key, &index, batch).await;
            report.succeeded += succeeded;
            report.failed += failed;
        }
        report
    }

    /// Learn the size of one representative document and derive the chunk size.
    fn plan_chunk(&self, stream_key: &str, documents: &[LogDocument]) -> Result<usize> {
        let Some(sample) = documents.first() else {
            return Ok(1);
        };
        let size = serde_json::to_vec(sample)?.len();
        let stats = self.sizes.record(stream_key, size);
        let chunk = chunk_size(self.budget_bytes, stats.average);
        metrics::set_chunk_size(stream_key, chunk);
        Ok(chunk)
    }

    /// Returns `(succeeded, failed)`.
    async fn write_chunk(&self, stream_key: &str, index: &str, documents: Vec<LogDocument>) -> (usize, usize) {
        let len = documents.len();
        let operations = match documents.iter().map(BulkOperation::from_document).collect::<Result<Vec<_>>>() {
            Ok(ops) => ops,
            Err(e) => {
                warn!(stream_key, error = %e, documents = len, "Chunk could not be serialized");
                metrics::record_bulk_failures(stream_key, "chunk", len);
                self.fail_all(index, documents);
                return (0, len);
            }
        };

        let request = BulkRequest::new(index, operations);
        let started = Instant::now();
        let outcome = self.circuit.call(|| self.store.bulk(&request)).await;

        match outcome {
            Ok(response) => {
                let failed_positions = response.failed_positions(len);
                metrics::record_bulk_request(stream_key, len, failed_positions.is_empty(), started.elapsed());
                if failed_positions.is_empty() {
                    return (len, 0);
                }

                warn!(
                    stream_key,
                    index,
                    failed = failed_positions.len(),
                    documents = len,
                    first_error = response.first_error().unwrap_or("unknown"),
                    "Bulk request had item failures"
                );
                metrics::record_bulk_failures(stream_key, "item", failed_positions.len());
                let failed = failed_positions.len();
                let mut positions = failed_positions.into_iter().peekable();
                for (position, document) in documents.into_iter().enumerate() {
                    if positions.peek() == Some(&position) {
                        positions.next();
                        self.failed.push(FailedDocument::new(index, document));
                    }
                }
                (len - failed, failed)
            }
            Err(e) => {
                metrics::record_bulk_request(stream_key, len, false, started.elapsed());
                if matches!(e, PipelineError::CircuitOpen(_)) {
                    warn!(stream_key, documents = len, "Store circuit open, chunk routed to failure warehouse");
                } else {
                    warn!(stream_key, error = %e, documents = len, "Bulk request failed, chunk routed to failure warehouse");
                }
                metrics::record_bulk_failures(stream_key, "chunk", len);
                self.fail_all(index, documents);
                (0, len)
            }
        }
    }

    fn fail_all(&self, index: &str, documents: Vec<LogDocument>) {
        self.failed
            .push_many(documents.into_iter().map(|doc| FailedDocument::new(index, doc)));
    }

    /// Tick until shutdown, then flush once more.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut trigger = FlushTrigger::new(self.config.batch_config());
        let mut ticker = tokio::time::interval(self.config.tick_duration());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(store = %self.store.endpoint(), parallelism = self.bulkhead.limit(), "Ingest engine started");
        loop {
            tokio::select! {
                biased;
                _ = resilience::shutdown_signal(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if trigger.should_flush(self.warehouse.len()) {
                        self.flush().await;
                        trigger.mark_flushed();
                    }
                }
            }
        }

        let report = self.flush().await;
        info!(flushed = report.total, failed = report.failed, "Ingest engine stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown).instrument(info_span!("ingest")))
    }

    /// Tick period, for callers that need to wait out one cycle.
    pub fn tick(&self) -> Duration {
        self.config.tick_duration()
    }
}

impl std::fmt::Debug for IngestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestEngine")
            .field("store", &self.store.endpoint())
            .field("pending", &self.warehouse.len())
            .field("budget_bytes", &self.budget_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use chrono::TimeZone;
    use store::MemoryStore;

    struct Harness {
        engine: IngestEngine,
        store: MemoryStore,
        failed: Arc<Warehouse<FailedDocument>>,
    }

    fn harness(budget_bytes: usize) -> Harness {
        let store = MemoryStore::new();
        let failed = Arc::new(Warehouse::new("failed_documents"));
        let store_config = StoreConfig {
            request_budget_bytes: budget_bytes,
            ..StoreConfig::for_testing()
        };
        let engine = IngestEngine::new(
            Arc::new(Warehouse::new("ingest")),
            failed.clone(),
            Arc::new(store.clone()),
            &IngestConfig::for_testing(),
            &store_config,
        );
        Harness { engine, store, failed }
    }

    fn event(key: &str, message: &str) -> LogEvent {
        LogEvent::new(key, Level::Information, "svc", message)
    }

    #[test]
    fn test_index_name() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 23, 0, 0).unwrap();
        assert_eq!(index_name("Billing", at), "billing-logs-2026-03-04");
    }

    #[tokio::test]
    async fn test_groups_by_stream_key() {
        let h = harness(10_000_000);
        h.engine.warehouse().push_many([event("A", "1"), event("A", "2"), event("B", "3")]);

        let report = h.engine.flush().await;

        assert_eq!(report, FlushReport { total: 3, groups: 2, succeeded: 3, failed: 0 });
        let mut indices: Vec<_> = h.store.requests().into_iter().map(|r| (r.index, r.operations.len())).collect();
        indices.sort();
        let today = Utc::now().format("%Y-%m-%d");
        assert_eq!(
            indices,
            vec![(format!("a-logs-{}", today), 2), (format!("b-logs-{}", today), 1)]
        );
    }

    #[tokio::test]
    async fn test_chunks_follow_size_budget() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        let sample = serde_json::to_vec(&LogDocument::from_event(&event("A", "x").at(at))).unwrap().len();
        // Room for two documents per request
        let h = harness(sample * 2 + 1);
        h.engine.warehouse().push_many((0..5).map(|_| event("A", "x").at(at)));

        let report = h.engine.flush().await;

        assert_eq!(report.succeeded, 5);
        let sizes: Vec<_> = h.store.requests().iter().map(|r| r.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(h.engine.sizes().get("A").map(|s| s.count), Some(1));
    }

    #[tokio::test]
    async fn test_item_failures_go_to_failure_warehouse() {
        let h = harness(10_000_000);
        let rejected = event("A", "bad");
        h.store.reject_ids([crate::document::document_id(&rejected)]);
        h.engine.warehouse().push_many([event("A", "good"), rejected]);

        let report = h.engine.flush().await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let failed = h.failed.drain().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].document.message, "bad");
        assert!(failed[0].index.starts_with("a-logs-"));
    }

    #[tokio::test]
    async fn test_chunk_failure_routes_whole_chunk() {
        let h = harness(10_000_000);
        h.store.fail_next_requests(1);
        h.engine.warehouse().push_many([event("A", "1"), event("A", "2")]);

        let report = h.engine.flush().await;

        assert_eq!(report.failed, 2);
        assert_eq!(h.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_events_sorted_before_grouping() {
        let h = harness(10_000_000);
        let now = Utc::now();
        h.engine.warehouse().push_many([
            event("A", "late").at(now),
            event("A", "early").at(now - chrono::Duration::seconds(10)),
        ]);

        h.engine.flush().await;

        let request = &h.store.requests()[0];
        let messages: Vec<_> = request.operations.iter().map(|op| op.document["message"].clone()).collect();
        assert_eq!(messages, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let h = harness(10_000_000);
        assert_eq!(h.engine.flush().await, FlushReport::default());
        assert_eq!(h.store.request_count(), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_trigger_and_shutdown() {
        let h = harness(10_000_000);
        let (tx, rx) = watch::channel(false);
        let handle = h.engine.clone().spawn(rx);

        h.engine.warehouse().push(event("A", "1"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.document_count(&index_name("A", Utc::now())) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.engine.warehouse().push(event("A", "2"));
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(h.store.document_count(&index_name("A", Utc::now())), 2);
    }
}
