//! Bounded asynchronous sinks.
//!
//! Every log destination (console, local file, central broker) sits behind a
//! [`BoundedSink`]: a fixed-capacity in-process queue drained by a pool of
//! background workers. Producers never wait on I/O.
//!
//! # Architecture
//!
//! ```text
//!  write(item) ──▶ ┌──────────────────────┐      ┌─ worker 1 ─┐
//!  (non-blocking)  │ ArrayQueue (capacity)│ ───▶ ├─ worker 2 ─┤──▶ SinkWriter::process
//!                  │ overflow policy      │      └─ worker N ─┘          │
//!                  └──────────────────────┘                              │ Err
//!                                                                        ▼
//!                                          fallback target ──(unavailable)──▶ last resort
//! ```
//!
//! # Lifecycle
//!
//! A sink is inert when constructed. [`BoundedSink::start()`] spawns the
//! workers; [`BoundedSink::stop()`] refuses new writes, lets the workers
//! drain what is queued, and flushes the writer.

pub mod central;
pub mod console;
pub mod file;

use crate::broker::BoxFuture;
use crate::error::{PipelineError, Result};
use crate::event::{ExceptionDetail, Level, LogEvent};
use crate::metrics;
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Stream key stamped on events the pipeline reports about itself.
pub const PIPELINE_STREAM_KEY: &str = "log-pipeline";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What to do with a write when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the least recent queued item to make room.
    DropOldest,
    /// Discard the item being written.
    DropNewest,
}

/// Result of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// Accepted after evicting the oldest queued item.
    DroppedOldest,
    /// Rejected because the queue was full.
    DroppedNewest,
    /// The sink is stopped.
    Closed,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::DroppedOldest => "dropped_oldest",
            Self::DroppedNewest => "dropped_newest",
            Self::Closed => "closed",
        }
    }
}

/// Performs the I/O for one destination.
pub trait SinkWriter<T>: Send + Sync + 'static {
    /// Handle one item. An error sends the item to the fallback.
    fn process<'a>(&'a self, item: &'a T) -> BoxFuture<'a, ()>;

    /// Push out anything buffered.
    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// If set, [`flush()`](Self::flush) also runs on this period.
    fn flush_interval(&self) -> Option<Duration> {
        None
    }
}

/// Something that accepts items without waiting: a fallback destination.
pub trait SinkTarget<T>: Send + Sync {
    /// Take the item, or hand it back if this target cannot accept it.
    fn offer(&self, item: T) -> std::result::Result<(), T>;
}

struct Shared<T> {
    queue: ArrayQueue<T>,
    notify: Notify,
    policy: OverflowPolicy,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    /// Queue `item` under the overflow policy. A rejected item is handed back.
    fn enqueue(&self, item: T) -> (WriteOutcome, Option<T>) {
        if self.closed.load(Ordering::Acquire) {
            return (WriteOutcome::Closed, Some(item));
        }
        match self.policy {
            OverflowPolicy::DropOldest => match self.queue.force_push(item) {
                None => (WriteOutcome::Accepted, None),
                Some(_evicted) => (WriteOutcome::DroppedOldest, None),
            },
            OverflowPolicy::DropNewest => match self.queue.push(item) {
                Ok(()) => (WriteOutcome::Accepted, None),
                Err(item) => (WriteOutcome::DroppedNewest, Some(item)),
            },
        }
    }
}

struct Worker<T> {
    name: String,
    shared: Arc<Shared<T>>,
    writer: Arc<dyn SinkWriter<T>>,
    fallback: Option<Arc<dyn SinkTarget<T>>>,
    last_resort: Option<Arc<dyn SinkTarget<LogEvent>>>,
}

impl<T: Send + Sync + 'static> Worker<T> {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut stopping = *stop.borrow();
        loop {
            let notified = self.shared.notify.notified();
            if let Some(item) = self.shared.queue.pop() {
                metrics::set_sink_queue_depth(&self.name, self.shared.queue.len());
                self.handle(item).await;
                continue;
            }
            if stopping {
                break;
            }
            tokio::select! {
                _ = notified => {}
                changed = stop.changed() => {
                    stopping = changed.is_err() || *stop.borrow();
                }
            }
        }
    }

    async fn handle(&self, item: T) {
        let err = match self.writer.process(&item).await {
            Ok(()) => return,
            Err(e) => e,
        };

        let item = match &self.fallback {
            Some(fallback) => match fallback.offer(item) {
                Ok(()) => {
                    debug!(sink = %self.name, error = %err, "Item routed to fallback");
                    metrics::record_sink_fallback(&self.name, "fallback");
                    return;
                }
                Err(item) => item,
            },
            None => item,
        };
        drop(item);

        metrics::record_sink_fallback(&self.name, "last_resort");
        error!(sink = %self.name, error = %err, "Sink failed and no fallback accepted the item, dropping it");
        if let Some(console) = &self.last_resort {
            let _ = console.offer(critical_event(&self.name, &err));
        }
    }
}

/// Event describing a sink failure, for the last-resort console.
pub fn critical_event(sink: &str, err: &PipelineError) -> LogEvent {
    LogEvent::new(
        PIPELINE_STREAM_KEY,
        Level::Error,
        format!("log_pipeline::sink::{}", sink),
        format!("{} sink critical error", sink),
    )
    .with_exception(ExceptionDetail::new(error_kind(err), err.to_string()))
}

fn error_kind(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::Broker { .. } | PipelineError::ChannelClosed => "BrokerError",
        PipelineError::Unroutable { .. } => "Unroutable",
        PipelineError::PublishNacked => "PublishNacked",
        PipelineError::Serialization(_) => "SerializationError",
        PipelineError::Compression(_) => "CompressionError",
        PipelineError::Io { .. } => "IoError",
        PipelineError::Store { .. } => "StoreError",
        PipelineError::CircuitOpen(_) => "CircuitOpen",
        PipelineError::Timeout(_) => "Timeout",
        PipelineError::Shutdown => "Shutdown",
        _ => "PipelineError",
    }
}

/// Builder for [`BoundedSink`].
pub struct SinkBuilder<T> {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    parallelism: usize,
    writer: Arc<dyn SinkWriter<T>>,
    fallback: Option<Arc<dyn SinkTarget<T>>>,
    last_resort: Option<Arc<dyn SinkTarget<LogEvent>>>,
}

impl<T: Send + Sync + 'static> SinkBuilder<T> {
    pub fn new(name: impl Into<String>, writer: Arc<dyn SinkWriter<T>>) -> Self {
        Self {
            name: name.into(),
            capacity: 10_000,
            policy: OverflowPolicy::DropOldest,
            parallelism: 1,
            writer,
            fallback: None,
            last_resort: None,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn SinkTarget<T>>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn last_resort(mut self, console: Arc<dyn SinkTarget<LogEvent>>) -> Self {
        self.last_resort = Some(console);
        self
    }

    pub fn build(self) -> BoundedSink<T> {
        let (stop_tx, _) = watch::channel(false);
        BoundedSink {
            worker: Arc::new(Worker {
                name: self.name,
                shared: Arc::new(Shared {
                    queue: ArrayQueue::new(self.capacity),
                    notify: Notify::new(),
                    policy: self.policy,
                    closed: AtomicBool::new(false),
                }),
                writer: self.writer,
                fallback: self.fallback,
                last_resort: self.last_resort,
            }),
            parallelism: self.parallelism,
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }
}

/// Bounded queue plus worker pool in front of a [`SinkWriter`].
pub struct BoundedSink<T> {
    worker: Arc<Worker<T>>,
    parallelism: usize,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> BoundedSink<T> {
    pub fn builder(name: impl Into<String>, writer: Arc<dyn SinkWriter<T>>) -> SinkBuilder<T> {
        SinkBuilder::new(name, writer)
    }

    pub fn name(&self) -> &str {
        &self.worker.name
    }

    pub fn capacity(&self) -> usize {
        self.worker.shared.queue.capacity()
    }

    /// Items waiting in the queue.
    pub fn len(&self) -> usize {
        self.worker.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.handles).is_empty()
    }

    /// Enqueue without waiting. Overflow follows the sink's policy.
    pub fn write(&self, item: T) -> WriteOutcome {
        self.enqueue(item).0
    }

    fn enqueue(&self, item: T) -> (WriteOutcome, Option<T>) {
        let (outcome, rejected) = self.worker.shared.enqueue(item);
        if rejected.is_none() {
            self.worker.shared.notify.notify_one();
        }
        metrics::record_sink_write(&self.worker.name, outcome.as_str());
        (outcome, rejected)
    }

    /// Spawn the workers (and the periodic flusher, if the writer wants one).
    pub fn start(&self) -> Result<()> {
        let mut handles = lock(&self.handles);
        if !handles.is_empty() || self.worker.shared.closed.load(Ordering::Acquire) {
            return Err(PipelineError::InvalidState {
                expected: "inert sink".to_string(),
                actual: format!("sink '{}' already started or stopped", self.worker.name),
            });
        }

        for id in 0..self.parallelism {
            let worker = self.worker.clone();
            let stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(
                worker.run(stop).instrument(info_span!("sink", name = %self.worker.name, worker = id)),
            ));
        }

        if let Some(period) = self.worker.writer.flush_interval() {
            let writer = self.worker.writer.clone();
            let name = self.worker.name.clone();
            let mut stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = writer.flush().await {
                                warn!(sink = %name, error = %e, "Periodic flush failed");
                            }
                        }
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        info!(sink = %self.worker.name, workers = self.parallelism, capacity = self.capacity(), "Sink started");
        Ok(())
    }

    /// Refuse new writes, drain the queue, flush the writer.
    ///
    /// Items still queued when `drain_timeout` expires are abandoned.
    pub async fn stop(&self, drain_timeout: Duration) -> Result<()> {
        self.worker.shared.closed.store(true, Ordering::Release);
        self.stop_tx.send_replace(true);
        self.worker.shared.notify.notify_waiters();

        let handles = std::mem::take(&mut *lock(&self.handles));
        let drained = tokio::time::timeout(drain_timeout, futures::future::join_all(handles)).await;
        if drained.is_err() {
            warn!(
                sink = %self.worker.name,
                abandoned = self.len(),
                "Sink did not drain before timeout"
            );
        }

        let flushed = self.worker.writer.flush().await;
        info!(sink = %self.worker.name, "Sink stopped");
        flushed
    }
}

impl<T: Send + Sync + 'static> SinkTarget<T> for BoundedSink<T> {
    /// A full drop-newest queue or a stopped sink hands the item back, so the
    /// caller can escalate to its last resort.
    fn offer(&self, item: T) -> std::result::Result<(), T> {
        match self.enqueue(item) {
            (_, Some(item)) => Err(item),
            (_, None) => Ok(()),
        }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for BoundedSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedSink")
            .field("name", &self.worker.name)
            .field("capacity", &self.capacity())
            .field("policy", &self.worker.shared.policy)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Records processed items; fails items listed in `fail`.
    struct Recorder {
        seen: Mutex<Vec<u32>>,
        fail: Vec<u32>,
        flushes: AtomicUsize,
    }

    impl Recorder {
        fn new(fail: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail,
                flushes: AtomicUsize::new(0),
            })
        }

        fn seen(&self) -> Vec<u32> {
            let mut seen = lock(&self.seen).clone();
            seen.sort_unstable();
            seen
        }
    }

    impl SinkWriter<u32> for Recorder {
        fn process<'a>(&'a self, item: &'a u32) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if self.fail.contains(item) {
                    return Err(PipelineError::broker("basic.publish", "boom"));
                }
                lock(&self.seen).push(*item);
                Ok(())
            })
        }

        fn flush(&self) -> BoxFuture<'_, ()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    struct Collect(Mutex<Vec<u32>>);

    impl SinkTarget<u32> for Collect {
        fn offer(&self, item: u32) -> std::result::Result<(), u32> {
            lock(&self.0).push(item);
            Ok(())
        }
    }

    struct Refuse;

    impl<T> SinkTarget<T> for Refuse {
        fn offer(&self, item: T) -> std::result::Result<(), T> {
            Err(item)
        }
    }

    struct Console(Mutex<Vec<LogEvent>>);

    impl SinkTarget<LogEvent> for Console {
        fn offer(&self, item: LogEvent) -> std::result::Result<(), LogEvent> {
            lock(&self.0).push(item);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_most_recent() {
        let recorder = Recorder::new(vec![]);
        let sink = BoundedSink::builder("t", recorder.clone() as Arc<dyn SinkWriter<u32>>)
            .capacity(3)
            .policy(OverflowPolicy::DropOldest)
            .build();

        assert_eq!(sink.write(1), WriteOutcome::Accepted);
        sink.write(2);
        sink.write(3);
        assert_eq!(sink.write(4), WriteOutcome::DroppedOldest);
        assert_eq!(sink.write(5), WriteOutcome::DroppedOldest);

        sink.start().unwrap();
        sink.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(recorder.seen(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_drop_newest_rejects_write() {
        let recorder = Recorder::new(vec![]);
        let sink = BoundedSink::builder("t", recorder.clone() as Arc<dyn SinkWriter<u32>>)
            .capacity(2)
            .policy(OverflowPolicy::DropNewest)
            .build();

        sink.write(1);
        sink.write(2);
        assert_eq!(sink.write(3), WriteOutcome::DroppedNewest);

        sink.start().unwrap();
        sink.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(recorder.seen(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_workers_drain_concurrently_and_flush_on_stop() {
        let recorder = Recorder::new(vec![]);
        let sink = BoundedSink::builder("t", recorder.clone() as Arc<dyn SinkWriter<u32>>)
            .capacity(1000)
            .parallelism(4)
            .build();
        sink.start().unwrap();
        assert!(sink.is_running());

        for i in 0..200 {
            sink.write(i);
        }
        sink.stop(Duration::from_secs(2)).await.unwrap();

        assert_eq!(recorder.seen(), (0..200).collect::<Vec<_>>());
        assert_eq!(recorder.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.write(1), WriteOutcome::Closed);
    }

    #[tokio::test]
    async fn test_failed_items_go_to_fallback() {
        let recorder = Recorder::new(vec![2, 4]);
        let fallback = Arc::new(Collect(Mutex::new(Vec::new())));
        let sink = BoundedSink::builder("t", recorder.clone() as Arc<dyn SinkWriter<u32>>)
            .fallback(fallback.clone())
            .build();
        sink.start().unwrap();

        for i in 1..=5 {
            sink.write(i);
        }
        sink.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(recorder.seen(), vec![1, 3, 5]);
        let mut fell_back = lock(&fallback.0).clone();
        fell_back.sort_unstable();
        assert_eq!(fell_back, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_unavailable_fallback_reports_to_last_resort() {
        let recorder = Recorder::new(vec![9]);
        let console = Arc::new(Console(Mutex::new(Vec::new())));
        let sink = BoundedSink::builder("central", recorder as Arc<dyn SinkWriter<u32>>)
            .fallback(Arc::new(Refuse))
            .last_resort(console.clone())
            .build();
        sink.start().unwrap();

        sink.write(9);
        sink.stop(Duration::from_secs(1)).await.unwrap();

        let reported = lock(&console.0);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].level, Level::Error);
        assert_eq!(reported[0].message, "central sink critical error");
        assert_eq!(reported[0].exception.as_ref().map(|e| e.kind.as_str()), Some("BrokerError"));
    }

    #[tokio::test]
    async fn test_full_drop_newest_fallback_escalates_to_last_resort() {
        let recorder = Recorder::new(vec![8, 9]);
        let console = Arc::new(Console(Mutex::new(Vec::new())));
        // Never started, so it stays full after one item
        let fallback = Arc::new(
            BoundedSink::builder("fallback", Recorder::new(vec![]) as Arc<dyn SinkWriter<u32>>)
                .capacity(1)
                .policy(OverflowPolicy::DropNewest)
                .build(),
        );
        let sink = BoundedSink::builder("central", recorder as Arc<dyn SinkWriter<u32>>)
            .fallback(fallback.clone())
            .last_resort(console.clone())
            .build();
        sink.start().unwrap();

        sink.write(8);
        sink.write(9);
        sink.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(fallback.len(), 1);
        assert_eq!(lock(&console.0).len(), 1);
    }

    #[test]
    fn test_offer_hands_back_item_when_full() {
        let newest = BoundedSink::builder("t", Recorder::new(vec![]) as Arc<dyn SinkWriter<u32>>)
            .capacity(1)
            .policy(OverflowPolicy::DropNewest)
            .build();
        assert_eq!(newest.offer(1), Ok(()));
        assert_eq!(newest.offer(2), Err(2));

        let oldest = BoundedSink::builder("t", Recorder::new(vec![]) as Arc<dyn SinkWriter<u32>>)
            .capacity(1)
            .policy(OverflowPolicy::DropOldest)
            .build();
        assert_eq!(oldest.offer(1), Ok(()));
        assert_eq!(oldest.offer(2), Ok(()));
        assert_eq!(oldest.len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let sink = BoundedSink::builder("t", Recorder::new(vec![]) as Arc<dyn SinkWriter<u32>>).build();
        sink.start().unwrap();
        assert!(matches!(sink.start(), Err(PipelineError::InvalidState { .. })));
        sink.stop(Duration::from_secs(1)).await.unwrap();
        assert!(sink.start().is_err());
    }

    #[tokio::test]
    async fn test_offer_refused_after_stop() {
        let sink = BoundedSink::builder("t", Recorder::new(vec![]) as Arc<dyn SinkWriter<u32>>).build();
        assert!(sink.offer(1).is_ok());
        sink.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(sink.offer(2), Err(2));
    }
}
