//! # Log Pipeline
//!
//! Reliable asynchronous log shipping from application processes to a
//! search/index store, through a topic broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────── producer process ───────────────────────────┐
//! │                                                                         │
//! │  LogEmitter ──┬──► console sink                                          │
//! │  (level filter│──► file sink ───► Logs/yyyy/mm/dd/log-*.log              │
//! │   + enrich)   └──► central sink ──► PublishService ──► ChannelPool ──┐   │
//! │                         │ (retries exhausted)                        │   │
//! │                         ▼                                            │   │
//! │                 failed_logs warehouse ─► hourly journal ─► replay ───┤   │
//! └──────────────────────────────────────────────────────────────────────┼───┘
//!                                                                         ▼
//!                                                      topic exchange (broker)
//!                                                                         │
//! ┌─────────────────────────── ingest process ─────────────────────────────┼───┐
//! │                                                                         ▼   │
//! │  ConsumerHost ──► LogEntryConsumer ──► ingest warehouse                      │
//! │                                             │ (size/time trigger)           │
//! │                                             ▼                               │
//! │                   IngestEngine: group by stream ─► adaptive chunks ─► store │
//! │                                             │ (chunk/item failures)         │
//! │                                             ▼                               │
//! │                 failed_documents warehouse ─► daily journal                 │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing on the producer path blocks the caller: sinks are bounded queues
//! with an overflow policy, and anything that cannot be delivered ends up in
//! an on-disk journal that is replayed later.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use log_pipeline::broker::memory::MemoryBroker;
//! use log_pipeline::ingest::store::MemoryStore;
//! use log_pipeline::{Level, LogEvent, LogPipeline, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> log_pipeline::Result<()> {
//!     let mut config = PipelineConfig::default();
//!     config.sinks.central.stream_key = "billing".into();
//!
//!     let mut pipeline = LogPipeline::new(config, Arc::new(MemoryBroker::new()), Arc::new(MemoryStore::new()))?;
//!     pipeline.start().await?;
//!     pipeline.emit(LogEvent::new("billing", Level::Warning, "Billing.Api", "invoice retried"));
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod broker;
pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod coordinator;
pub mod document;
pub mod emitter;
pub mod error;
pub mod event;
pub mod ingest;
pub mod journal;
pub mod metrics;
pub mod pool;
pub mod publish;
pub mod resilience;
pub mod sink;
pub mod warehouse;

// Re-exports for convenience
pub use broker::{BrokerConnector, ExchangeKind, ExchangeSpec, QueueSpec};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitStats};
pub use config::PipelineConfig;
pub use consumer::{ConsumeDescriptor, ConsumeOutcome, Consumer, ConsumerRegistry};
pub use coordinator::{EngineState, HealthCheck, LogPipeline};
pub use document::{FailedDocument, LogDocument};
pub use emitter::LogEmitter;
pub use error::{PipelineError, Result};
pub use event::{ExceptionDetail, Level, LogEvent};
pub use ingest::store::{BulkStore, MemoryStore};
pub use publish::{PublishRequest, PublishService};
pub use sink::{BoundedSink, OverflowPolicy, SinkWriter, WriteOutcome};
pub use warehouse::Warehouse;
