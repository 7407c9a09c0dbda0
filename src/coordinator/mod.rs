// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log pipeline supervisor.
//!
//! The main orchestrator that ties together:
//! - The broker connection and channel pool ([`crate::connection`], [`crate::pool`])
//! - Producer sinks behind the [`LogEmitter`] ([`crate::sink`])
//! - Consumers feeding the ingest warehouse ([`crate::consumer`])
//! - Adaptive bulk ingestion ([`crate::ingest`])
//! - Failure journals, replay and retention ([`crate::journal`])
//!
//! # Lifecycle
//!
//! Everything is constructed inert in [`LogPipeline::new()`]. [`start()`]
//! spawns the background tasks; [`shutdown()`] stops them in dependency order:
//! 1. Sinks drain (publish failures land in the failed-log warehouse)
//! 2. Consumers, ingest, replay and retention stop (ingest flushes once more)
//! 3. Archive workers write whatever the failure warehouses still hold
//! 4. The broker connection closes
//!
//! [`start()`]: LogPipeline::start
//! [`shutdown()`]: LogPipeline::shutdown

mod types;

pub use types::{EngineState, HealthCheck, SinkHealth};

use crate::broker::BrokerConnector;
use crate::config::PipelineConfig;
use crate::connection::ConnectionManager;
use crate::consumer::log_entry::LogEntryConsumer;
use crate::consumer::runtime::ConsumerHost;
use crate::consumer::{ConsumerRegistry, ErasedConsumer};
use crate::document::FailedDocument;
use crate::emitter::LogEmitter;
use crate::error::{PipelineError, Result};
use crate::event::LogEvent;
use crate::ingest::store::BulkStore;
use crate::ingest::IngestEngine;
use crate::journal::archive::ArchiveWorker;
use crate::journal::replay::{BrokerReplayTarget, ReplayWorker, StoreReplayTarget};
use crate::journal::retention::RetentionWorker;
use crate::journal::JournalLayout;
use crate::metrics;
use crate::pool::ChannelPool;
use crate::publish::PublishService;
use crate::sink::central::CentralWriter;
use crate::sink::console::ConsoleWriter;
use crate::sink::file::FileWriter;
use crate::sink::{BoundedSink, SinkTarget};
use crate::warehouse::Warehouse;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The log pipeline: producer sinks, consumers, ingestion and failure journals.
pub struct LogPipeline {
    config: PipelineConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    connection: ConnectionManager,
    pool: ChannelPool,
    store: Arc<dyn BulkStore>,

    emitter: Arc<LogEmitter>,
    console: Option<Arc<BoundedSink<LogEvent>>>,
    central_writer: Option<Arc<CentralWriter>>,

    /// Central publish failures, journaled hourly.
    failed_logs: Arc<Warehouse<LogEvent>>,
    /// Bulk ingest failures, journaled daily.
    failed_documents: Arc<Warehouse<FailedDocument>>,
    ingest: IngestEngine,
    registry: ConsumerRegistry,

    /// Stops consumers, ingest, replay, retention and the connection tasks.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Stops the archive workers, after everything that feeds them.
    archive_tx: watch::Sender<bool>,

    tasks: Vec<JoinHandle<()>>,
    archive_tasks: Vec<JoinHandle<()>>,
}

impl LogPipeline {
    /// Build every component without starting anything.
    pub fn new(config: PipelineConfig, connector: Arc<dyn BrokerConnector>, store: Arc<dyn BulkStore>) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (archive_tx, _) = watch::channel(false);

        let connection = ConnectionManager::new(
            connector,
            config.broker.retry_config(),
            config.broker.reconnect_config(),
        );
        let pool = ChannelPool::new(connection.clone(), config.broker.pool_size);

        let failed_logs = Arc::new(Warehouse::new("failed_logs"));
        let failed_documents = Arc::new(Warehouse::new("failed_documents"));
        let received = Arc::new(Warehouse::new("ingest").with_soft_cap(config.ingest.soft_cap));

        let sinks_config = &config.sinks;
        let console = sinks_config.console.enabled.then(|| {
            Arc::new(
                BoundedSink::<LogEvent>::builder("console", Arc::new(ConsoleWriter::stdout(sinks_config.console.format)))
                    .capacity(sinks_config.console.capacity)
                    .policy(sinks_config.console.overflow)
                    .parallelism(sinks_config.console.parallelism)
                    .build(),
            )
        });
        let last_resort = console.clone().map(|c| c as Arc<dyn SinkTarget<LogEvent>>);

        let mut sinks = Vec::new();
        if let Some(console) = &console {
            sinks.push(console.clone());
        }

        if sinks_config.file.enabled {
            let mut builder = BoundedSink::<LogEvent>::builder("file", Arc::new(FileWriter::new(&sinks_config.file)))
                .capacity(sinks_config.file.capacity)
                .policy(sinks_config.file.overflow)
                .parallelism(sinks_config.file.parallelism);
            if let Some(console) = &last_resort {
                builder = builder.last_resort(console.clone());
            }
            sinks.push(Arc::new(builder.build()));
        }

        let central_writer = sinks_config.central.enabled.then(|| {
            let publisher = PublishService::new(
                pool.clone(),
                sinks_config.central.publish_timeout_duration(),
                shutdown_rx.clone(),
            );
            Arc::new(CentralWriter::new(publisher, &sinks_config.central))
        });
        if let Some(writer) = &central_writer {
            let mut builder = BoundedSink::<LogEvent>::builder("central", writer.clone())
                .capacity(sinks_config.central.capacity)
                .policy(sinks_config.central.overflow)
                .parallelism(sinks_config.central.parallelism)
                .fallback(failed_logs.clone());
            if let Some(console) = &last_resort {
                builder = builder.last_resort(console.clone());
            }
            sinks.push(Arc::new(builder.build()));
        }

        let emitter = Arc::new(LogEmitter::new(&config.emitter, sinks));
        let ingest = IngestEngine::new(received.clone(), failed_documents.clone(), store.clone(), &config.ingest, &config.store);

        let mut registry = ConsumerRegistry::new();
        if config.consumer.enabled {
            let exchange = &config.sinks.central.exchange;
            registry = registry.register(LogEntryConsumer::general(received.clone(), exchange));
            for stream_key in &config.consumer.specific_streams {
                registry = registry.register(LogEntryConsumer::specific(received.clone(), exchange, stream_key));
            }
        }

        Ok(Self {
            config,
            state_tx,
            state_rx,
            connection,
            pool,
            store,
            emitter,
            console,
            central_writer,
            failed_logs,
            failed_documents,
            ingest,
            registry,
            shutdown_tx,
            shutdown_rx,
            archive_tx,
            tasks: Vec::new(),
            archive_tasks: Vec::new(),
        })
    }

    /// Build against RabbitMQ and the HTTP bulk store described by `config`.
    #[cfg(feature = "amqp")]
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let connector = Arc::new(crate::broker::amqp::AmqpConnector::new(&config.broker));
        let store = Arc::new(crate::ingest::elastic::ElasticStore::new(&config.store)?);
        Self::new(config, connector, store)
    }

    /// Add a consumer besides the shipped log-entry consumers. Before `start()` only.
    pub fn register_consumer(&mut self, consumer: Arc<dyn ErasedConsumer>) -> Result<()> {
        self.expect_state(EngineState::Created)?;
        self.registry = std::mem::take(&mut self.registry).register_arc(consumer);
        Ok(())
    }

    pub fn emitter(&self) -> &Arc<LogEmitter> {
        &self.emitter
    }

    /// Shorthand for `emitter().emit(event)`.
    pub fn emit(&self, event: LogEvent) -> usize {
        self.emitter.emit(event)
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn ingest(&self) -> &IngestEngine {
        &self.ingest
    }

    pub fn failed_logs(&self) -> &Arc<Warehouse<LogEvent>> {
        &self.failed_logs
    }

    pub fn failed_documents(&self) -> &Arc<Warehouse<FailedDocument>> {
        &self.failed_documents
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
        metrics::set_engine_state(state.as_str());
    }

    fn expect_state(&self, expected: EngineState) -> Result<()> {
        let actual = self.state();
        if actual != expected {
            return Err(PipelineError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Health snapshot for readiness/liveness endpoints. No network I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let broker_connected = self.connection.is_connected().await;
        let sinks: Vec<SinkHealth> = self
            .emitter
            .sinks()
            .iter()
            .map(|sink| SinkHealth {
                name: sink.name().to_string(),
                queued: sink.len(),
                capacity: sink.capacity(),
                running: sink.is_running(),
            })
            .collect();

        let ready = state == EngineState::Running && broker_connected;
        let healthy = ready && sinks.iter().all(|s| s.queued < s.capacity);

        HealthCheck {
            state,
            ready,
            broker_connected,
            ingest_pending: self.ingest.warehouse().len(),
            failed_logs_pending: self.failed_logs.len(),
            failed_documents_pending: self.failed_documents.len(),
            store_rejections: self.ingest.circuit().rejections(),
            sinks,
            healthy,
        }
    }

    /// Start every background task.
    ///
    /// 1. Connection watcher and pool purge listener
    /// 2. Sink workers
    /// 3. Archive workers for both failure journals
    /// 4. Consumers and the ingest engine
    /// 5. Replay and retention workers (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        self.expect_state(EngineState::Created)?;

        info!(
            endpoint = %self.connection.endpoint(),
            store = %self.store.endpoint(),
            sinks = self.emitter.sinks().len(),
            consumers = self.registry.len(),
            "Starting log pipeline"
        );
        self.set_state(EngineState::Starting);

        self.tasks.push(self.connection.spawn_watcher(self.shutdown_rx.clone()));
        self.tasks.push(self.pool.spawn_purge_listener(self.shutdown_rx.clone()));

        for sink in self.emitter.sinks() {
            if let Err(e) = sink.start() {
                error!(sink = %sink.name(), error = %e, "Sink failed to start");
                metrics::record_error("startup", "sink_start");
                self.set_state(EngineState::Failed);
                self.shutdown_tx.send_replace(true);
                return Err(e);
            }
        }

        let archive_rx = self.archive_tx.subscribe();
        self.archive_tasks.push(
            ArchiveWorker::new("failed_logs", self.failed_logs.clone(), &self.config.failed_logs)
                .spawn(archive_rx.clone()),
        );
        self.archive_tasks.push(
            ArchiveWorker::new("failed_documents", self.failed_documents.clone(), &self.config.failed_documents)
                .spawn(archive_rx),
        );

        if !self.registry.is_empty() {
            let host = ConsumerHost::new(self.pool.clone(), self.registry.clone(), self.config.consumer.clone());
            self.tasks.extend(host.start(self.shutdown_rx.clone()));
        }

        if self.config.ingest.enabled {
            self.tasks.push(self.ingest.clone().spawn(self.shutdown_rx.clone()));
        }

        self.spawn_journal_workers();

        self.set_state(EngineState::Running);
        info!(tasks = self.tasks.len() + self.archive_tasks.len(), "Log pipeline running");
        Ok(())
    }

    fn spawn_journal_workers(&mut self) {
        let logs_layout = JournalLayout::new(&self.config.failed_logs.base_folder, self.config.failed_logs.rotation);
        let documents_layout = JournalLayout::new(
            &self.config.failed_documents.base_folder,
            self.config.failed_documents.rotation,
        );

        if self.config.replay.enabled {
            if let Some(writer) = &self.central_writer {
                let target = Arc::new(BrokerReplayTarget::new(writer.clone()));
                self.tasks.push(
                    ReplayWorker::new("failed_logs", logs_layout.clone(), target, &self.config.replay)
                        .spawn(self.shutdown_rx.clone()),
                );
            } else {
                debug!("Central sink disabled, failed-log replay not started");
            }
            if self.config.replay.documents_enabled {
                let target = Arc::new(StoreReplayTarget::new(self.store.clone()));
                self.tasks.push(
                    ReplayWorker::new("failed_documents", documents_layout.clone(), target, &self.config.replay)
                        .spawn(self.shutdown_rx.clone()),
                );
            }
        }

        if self.config.retention.enabled {
            self.tasks.push(
                RetentionWorker::new("failed_logs", logs_layout, &self.config.retention).spawn(self.shutdown_rx.clone()),
            );
            self.tasks.push(
                RetentionWorker::new("failed_documents", documents_layout, &self.config.retention)
                    .spawn(self.shutdown_rx.clone()),
            );
        }
    }

    /// Shut the pipeline down gracefully.
    ///
    /// Each phase waits at most the configured drain timeout.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), EngineState::Stopped | EngineState::ShuttingDown) {
            return;
        }
        info!("Shutting down log pipeline");
        self.set_state(EngineState::ShuttingDown);
        let drain_timeout = self.config.consumer.drain_timeout_duration();

        // Producer side first; the console goes last, it is everyone's last resort
        let mut sinks: Vec<_> = self.emitter.sinks().to_vec();
        if let Some(console) = &self.console {
            sinks.retain(|s| !Arc::ptr_eq(s, console));
            sinks.push(console.clone());
        }
        for sink in sinks {
            if let Err(e) = sink.stop(drain_timeout).await {
                warn!(sink = %sink.name(), error = %e, "Sink flush failed during shutdown");
                metrics::record_error("shutdown", "sink_flush");
            }
        }

        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut self.tasks);
        await_all("worker", tasks, drain_timeout).await;

        self.archive_tx.send_replace(true);
        let archives = std::mem::take(&mut self.archive_tasks);
        await_all("archive", archives, drain_timeout).await;

        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Broker connection did not close cleanly");
            metrics::record_error("shutdown", "connection_close");
        }

        self.set_state(EngineState::Stopped);
        info!(
            failed_logs_left = self.failed_logs.len(),
            failed_documents_left = self.failed_documents.len(),
            "Log pipeline stopped"
        );
    }
}

async fn await_all(kind: &str, handles: Vec<JoinHandle<()>>, drain_timeout: Duration) {
    if handles.is_empty() {
        return;
    }
    info!(kind, task_count = handles.len(), "Waiting for tasks to drain and complete");
    for (i, handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout(drain_timeout, handle).await {
            Ok(Ok(())) => debug!(kind, task = i + 1, "Task completed gracefully"),
            Ok(Err(e)) => {
                warn!(kind, task = i + 1, error = %e, "Task panicked during shutdown");
                metrics::record_error("shutdown", "task_panic");
            }
            Err(_) => {
                warn!(kind, task = i + 1, "Task timed out during shutdown");
                metrics::record_error("shutdown", "task_timeout");
            }
        }
    }
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeline")
            .field("state", &self.state())
            .field("endpoint", &self.connection.endpoint())
            .field("store", &self.store.endpoint())
            .field("consumers", &self.registry)
            .finish()
    }
}
