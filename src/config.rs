//! Configuration for the log pipeline.
//!
//! Every section deserializes from YAML/JSON with per-field defaults, so a
//! config file only needs to name what differs. Loading the file is up to the
//! host process.
//!
//! # Quick Start
//!
//! ```rust
//! use log_pipeline::config::PipelineConfig;
//!
//! let mut config = PipelineConfig::default();
//! config.sinks.central.stream_key = "billing".into();
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! PipelineConfig
//! ├── broker: BrokerConfig             # host, credentials, pool size, connect backoff
//! ├── store: StoreConfig               # bulk endpoint, request byte budget, circuit
//! ├── sinks: SinksConfig
//! │   ├── console: ConsoleSinkConfig
//! │   ├── file: FileSinkConfig         # hour-bucketed local log files
//! │   └── central: CentralSinkConfig   # publish to the broker
//! ├── emitter: EmitterConfig           # per-category levels, static enrichers
//! ├── consumer: ConsumerSettings
//! ├── ingest: IngestConfig             # size/time trigger, group parallelism
//! ├── failed_logs: JournalConfig       # publish failures → hourly journal
//! ├── failed_documents: JournalConfig  # bulk failures → daily journal
//! ├── replay: ReplayConfig
//! └── retention: RetentionConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! broker:
//!   host: "rabbit.internal"
//!   user: "logs"
//!   password: "secret"
//!   pool_size: 20
//! sinks:
//!   central:
//!     stream_key: "billing"
//!     capacity: 20000
//!   file:
//!     enabled: true
//!     base_folder: "/var/log/billing"
//! emitter:
//!   levels:
//!     Default: "Information"
//!     "Microsoft.Hosting": "Warning"
//! replay:
//!   interval: "15m"
//! ```

use crate::error::{PipelineError, Result};
use crate::event::Level;
use crate::journal::Rotation;
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::sink::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Parse a humantime duration string, falling back on bad input.
///
/// `PipelineConfig::validate` rejects unparsable values, so the fallback
/// only applies to configs that skipped validation.
fn duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn check_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| PipelineError::Config(format!("{}: invalid duration {:?}: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sinks: SinksConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default = "JournalConfig::failed_logs")]
    pub failed_logs: JournalConfig,
    #[serde(default = "JournalConfig::failed_documents")]
    pub failed_documents: JournalConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            sinks: SinksConfig::default(),
            emitter: EmitterConfig::default(),
            consumer: ConsumerSettings::default(),
            ingest: IngestConfig::default(),
            failed_logs: JournalConfig::failed_logs(),
            failed_documents: JournalConfig::failed_documents(),
            replay: ReplayConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Short timings and journals under `root`. For tests.
    pub fn for_testing(root: impl Into<PathBuf>, stream_key: &str) -> Self {
        let root = root.into();
        let mut config = Self::default();
        config.broker = BrokerConfig::for_testing();
        config.store = StoreConfig::for_testing();
        config.sinks.console.enabled = false;
        config.sinks.file = FileSinkConfig::for_testing(root.join("Logs"));
        config.sinks.central = CentralSinkConfig::for_testing(stream_key);
        config.consumer = ConsumerSettings::for_testing();
        config.ingest = IngestConfig::for_testing();
        config.failed_logs = JournalConfig {
            base_folder: root.join("FailedLogs"),
            ..JournalConfig::failed_logs().for_testing()
        };
        config.failed_documents = JournalConfig {
            base_folder: root.join("FailedEcsLogs"),
            ..JournalConfig::failed_documents().for_testing()
        };
        config.replay = ReplayConfig::for_testing();
        config.retention = RetentionConfig::default();
        config
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.broker.pool_size == 0 {
            return Err(PipelineError::Config("broker.pool_size must be > 0".into()));
        }
        if self.broker.connect_attempts == 0 {
            return Err(PipelineError::Config("broker.connect_attempts must be > 0".into()));
        }
        for (name, capacity, parallelism) in [
            ("console", self.sinks.console.capacity, self.sinks.console.parallelism),
            ("file", self.sinks.file.capacity, self.sinks.file.parallelism),
            ("central", self.sinks.central.capacity, self.sinks.central.parallelism),
        ] {
            if capacity == 0 || parallelism == 0 {
                return Err(PipelineError::Config(format!(
                    "sinks.{}: capacity and parallelism must be > 0",
                    name
                )));
            }
        }
        if self.sinks.central.enabled && self.sinks.central.stream_key.trim().is_empty() {
            return Err(PipelineError::Config(
                "sinks.central.stream_key is required when the central sink is enabled".into(),
            ));
        }
        if self.ingest.parallelism == 0 || self.ingest.trigger_size == 0 {
            return Err(PipelineError::Config("ingest trigger_size and parallelism must be > 0".into()));
        }
        if self.store.request_budget_bytes == 0 {
            return Err(PipelineError::Config("store.request_budget_bytes must be > 0".into()));
        }
        if self.retention.keep_recent_days >= self.retention.scan_days {
            return Err(PipelineError::Config(
                "retention.keep_recent_days must be smaller than retention.scan_days".into(),
            ));
        }
        for (field, value) in self.durations() {
            check_duration(field, value)?;
        }
        Ok(())
    }

    fn durations(&self) -> [(&'static str, &str); 17] {
        [
            ("broker.backoff_base", &self.broker.backoff_base),
            ("broker.backoff_max", &self.broker.backoff_max),
            ("broker.connection_timeout", &self.broker.connection_timeout),
            ("store.request_timeout", &self.store.request_timeout),
            ("store.circuit_recovery", &self.store.circuit_recovery),
            ("sinks.file.write_interval", &self.sinks.file.write_interval),
            ("sinks.central.publish_timeout", &self.sinks.central.publish_timeout),
            ("consumer.resubscribe_delay", &self.consumer.resubscribe_delay),
            ("consumer.drain_timeout", &self.consumer.drain_timeout),
            ("ingest.tick", &self.ingest.tick),
            ("ingest.trigger_interval", &self.ingest.trigger_interval),
            ("failed_logs.tick", &self.failed_logs.tick),
            ("failed_logs.trigger_interval", &self.failed_logs.trigger_interval),
            ("failed_documents.tick", &self.failed_documents.tick),
            ("failed_documents.trigger_interval", &self.failed_documents.trigger_interval),
            ("replay.interval", &self.replay.interval),
            ("retention.interval", &self.retention.interval),
        ]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BrokerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub user: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Shown in the broker management UI.
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    /// Maximum idle channels kept by the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Attempts for an explicit connect before the error surfaces.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,
    /// Delay after the first failed attempt; doubles per attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,
    /// Ceiling for the reconnect loop, which never gives up.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5672
}
fn default_guest() -> String {
    "guest".to_string()
}
fn default_vhost() -> String {
    "/".to_string()
}
fn default_connection_name() -> String {
    "log-pipeline".to_string()
}
fn default_pool_size() -> usize {
    20
}
fn default_connect_attempts() -> usize {
    5
}
fn default_backoff_base() -> String {
    "2s".to_string()
}
fn default_backoff_max() -> String {
    "32s".to_string()
}
fn default_connection_timeout() -> String {
    "30s".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_guest(),
            password: default_guest(),
            vhost: default_vhost(),
            connection_name: default_connection_name(),
            pool_size: default_pool_size(),
            connect_attempts: default_connect_attempts(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn for_testing() -> Self {
        Self {
            pool_size: 4,
            connect_attempts: 3,
            backoff_base: "10ms".to_string(),
            backoff_max: "50ms".to_string(),
            connection_timeout: "500ms".to_string(),
            ..Self::default()
        }
    }

    /// Bounded retry used by explicit connects.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.connect_attempts.max(1),
            initial_delay: duration_or(&self.backoff_base, Duration::from_secs(2)),
            max_delay: duration_or(&self.backoff_max, Duration::from_secs(32)),
            backoff_factor: 2.0,
            connection_timeout: duration_or(&self.connection_timeout, Duration::from_secs(30)),
        }
    }

    /// Unbounded retry used after a connection drops.
    pub fn reconnect_config(&self) -> RetryConfig {
        self.retry_config().unbounded()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
    /// Target serialized size of one bulk request.
    #[serde(default = "default_request_budget")]
    pub request_budget_bytes: usize,
    /// Failure ratio that opens the store circuit.
    #[serde(default = "default_circuit_failure_rate")]
    pub circuit_failure_rate: f32,
    #[serde(default = "default_circuit_window")]
    pub circuit_window: usize,
    #[serde(default = "default_circuit_recovery")]
    pub circuit_recovery: String,
}

fn default_store_endpoint() -> String {
    "http://localhost:9200".to_string()
}
fn default_request_timeout() -> String {
    "30s".to_string()
}
fn default_request_budget() -> usize {
    10 * 1000 * 1000
}
fn default_circuit_failure_rate() -> f32 {
    0.5
}
fn default_circuit_window() -> usize {
    10
}
fn default_circuit_recovery() -> String {
    "30s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_store_endpoint(),
            username: None,
            password: None,
            request_timeout: default_request_timeout(),
            request_budget_bytes: default_request_budget(),
            circuit_failure_rate: default_circuit_failure_rate(),
            circuit_window: default_circuit_window(),
            circuit_recovery: default_circuit_recovery(),
        }
    }
}

impl StoreConfig {
    pub fn for_testing() -> Self {
        Self {
            request_timeout: "1s".to_string(),
            circuit_recovery: "50ms".to_string(),
            ..Self::default()
        }
    }

    pub fn request_timeout_duration(&self) -> Duration {
        duration_or(&self.request_timeout, Duration::from_secs(30))
    }

    pub fn circuit_config(&self) -> crate::circuit_breaker::CircuitConfig {
        crate::circuit_breaker::CircuitConfig {
            failure_rate: self.circuit_failure_rate,
            window: self.circuit_window,
            half_open_probes: 2,
            recovery_timeout: duration_or(&self.circuit_recovery, Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SinksConfig {
    #[serde(default)]
    pub console: ConsoleSinkConfig,
    #[serde(default)]
    pub file: FileSinkConfig,
    #[serde(default)]
    pub central: CentralSinkConfig,
}

/// How the console sink renders events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// `timestamp LEVEL [source] message`.
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_console_capacity")]
    pub capacity: usize,
    #[serde(default = "default_drop_newest")]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_one")]
    pub parallelism: usize,
    #[serde(default)]
    pub format: ConsoleFormat,
}

fn default_true() -> bool {
    true
}
fn default_one() -> usize {
    1
}
fn default_console_capacity() -> usize {
    10_000
}
fn default_drop_newest() -> OverflowPolicy {
    OverflowPolicy::DropNewest
}
fn default_drop_oldest() -> OverflowPolicy {
    OverflowPolicy::DropOldest
}

impl Default for ConsoleSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_console_capacity(),
            overflow: OverflowPolicy::DropNewest,
            parallelism: 1,
            format: ConsoleFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSinkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_logs_folder")]
    pub base_folder: PathBuf,
    #[serde(default = "default_file_capacity")]
    pub capacity: usize,
    #[serde(default = "default_drop_oldest")]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_file_parallelism")]
    pub parallelism: usize,
    /// Flush once this many lines are buffered.
    #[serde(default = "default_write_size")]
    pub write_size: usize,
    /// Flush when this much time passed since the last flush.
    #[serde(default = "default_write_interval")]
    pub write_interval: String,
}

fn default_logs_folder() -> PathBuf {
    PathBuf::from("Logs")
}
fn default_file_capacity() -> usize {
    10_000
}
fn default_file_parallelism() -> usize {
    20
}
fn default_write_size() -> usize {
    100
}
fn default_write_interval() -> String {
    "2s".to_string()
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_folder: default_logs_folder(),
            capacity: default_file_capacity(),
            overflow: OverflowPolicy::DropOldest,
            parallelism: default_file_parallelism(),
            write_size: default_write_size(),
            write_interval: default_write_interval(),
        }
    }
}

impl FileSinkConfig {
    pub fn for_testing(base_folder: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            base_folder: base_folder.into(),
            capacity: 1000,
            parallelism: 2,
            write_size: 10,
            write_interval: "50ms".to_string(),
            ..Self::default()
        }
    }

    pub fn write_interval_duration(&self) -> Duration {
        duration_or(&self.write_interval, Duration::from_secs(2))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralSinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stream key of this application (lowercased into the routing key).
    #[serde(default)]
    pub stream_key: String,
    /// Route to `project.<key>.specific` instead of `.general`.
    #[serde(default)]
    pub specific: bool,
    #[serde(default = "default_exchange_name")]
    pub exchange: String,
    #[serde(default = "default_central_capacity")]
    pub capacity: usize,
    #[serde(default = "default_drop_oldest")]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_central_parallelism")]
    pub parallelism: usize,
    /// Retries after the first publish attempt.
    #[serde(default = "default_try_count")]
    pub try_count: u32,
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: String,
}

fn default_exchange_name() -> String {
    "central-logs-exchange".to_string()
}
fn default_central_capacity() -> usize {
    20_000
}
fn default_central_parallelism() -> usize {
    20
}
fn default_try_count() -> u32 {
    5
}
fn default_publish_timeout() -> String {
    "30s".to_string()
}

impl Default for CentralSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_key: String::new(),
            specific: false,
            exchange: default_exchange_name(),
            capacity: default_central_capacity(),
            overflow: OverflowPolicy::DropOldest,
            parallelism: default_central_parallelism(),
            try_count: default_try_count(),
            compress: true,
            publish_timeout: default_publish_timeout(),
        }
    }
}

impl CentralSinkConfig {
    pub fn for_testing(stream_key: &str) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            capacity: 1000,
            parallelism: 4,
            try_count: 2,
            publish_timeout: "1s".to_string(),
            ..Self::default()
        }
    }

    pub fn publish_timeout_duration(&self) -> Duration {
        duration_or(&self.publish_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EmitterConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Key under which the fallback minimum level is stored.
pub const DEFAULT_CATEGORY: &str = "Default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    /// Minimum level per category prefix; `Default` applies otherwise.
    #[serde(default = "default_levels")]
    pub levels: BTreeMap<String, Level>,
    /// Static labels merged into every event.
    #[serde(default)]
    pub enrichers: BTreeMap<String, String>,
}

fn default_levels() -> BTreeMap<String, Level> {
    BTreeMap::from([(DEFAULT_CATEGORY.to_string(), Level::Information)])
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            enrichers: BTreeMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wait before re-subscribing after a channel or connection loss.
    #[serde(default = "default_resubscribe_delay")]
    pub resubscribe_delay: String,
    /// How long each background task may take to drain on shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
    /// Stream keys whose `specific` queues are consumed, besides the general queue.
    #[serde(default)]
    pub specific_streams: Vec<String>,
}

fn default_resubscribe_delay() -> String {
    "2s".to_string()
}
fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            resubscribe_delay: default_resubscribe_delay(),
            drain_timeout: default_drain_timeout(),
            specific_streams: Vec::new(),
        }
    }
}

impl ConsumerSettings {
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            resubscribe_delay: "20ms".to_string(),
            drain_timeout: "2s".to_string(),
            specific_streams: Vec::new(),
        }
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        duration_or(&self.drain_timeout, Duration::from_secs(10))
    }

    pub fn resubscribe_delay_duration(&self) -> Duration {
        duration_or(&self.resubscribe_delay, Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IngestConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often the trigger is evaluated.
    #[serde(default = "default_tick")]
    pub tick: String,
    /// Flush once the warehouse holds this many events.
    #[serde(default = "default_ingest_trigger_size")]
    pub trigger_size: usize,
    /// Flush when this much time passed since the last flush.
    #[serde(default = "default_ingest_trigger_interval")]
    pub trigger_interval: String,
    /// Stream groups ingesting concurrently.
    #[serde(default = "default_ingest_parallelism")]
    pub parallelism: usize,
    /// Consumers wait while the ingest warehouse holds more than this many events.
    #[serde(default)]
    pub soft_cap: Option<usize>,
}

fn default_tick() -> String {
    "100ms".to_string()
}
fn default_ingest_trigger_size() -> usize {
    1000
}
fn default_ingest_trigger_interval() -> String {
    "2s".to_string()
}
fn default_ingest_parallelism() -> usize {
    10
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick: default_tick(),
            trigger_size: default_ingest_trigger_size(),
            trigger_interval: default_ingest_trigger_interval(),
            parallelism: default_ingest_parallelism(),
            soft_cap: None,
        }
    }
}

impl IngestConfig {
    pub fn for_testing() -> Self {
        Self {
            tick: "10ms".to_string(),
            trigger_size: 100,
            trigger_interval: "50ms".to_string(),
            ..Self::default()
        }
    }

    pub fn tick_duration(&self) -> Duration {
        duration_or(&self.tick, Duration::from_millis(100))
    }

    pub fn batch_config(&self) -> crate::batch::BatchConfig {
        crate::batch::BatchConfig {
            max_batch_size: self.trigger_size,
            max_batch_delay: duration_or(&self.trigger_interval, Duration::from_secs(2)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JournalConfig: failure warehouses flushed to disk
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub base_folder: PathBuf,
    pub rotation: Rotation,
    #[serde(default = "default_tick")]
    pub tick: String,
    pub trigger_size: usize,
    pub trigger_interval: String,
    /// Lines per write call.
    #[serde(default = "default_write_chunk")]
    pub write_chunk: usize,
}

fn default_write_chunk() -> usize {
    3000
}

impl JournalConfig {
    /// Central-log publish failures: hourly files, 1000 entries or 10 seconds.
    pub fn failed_logs() -> Self {
        Self {
            base_folder: PathBuf::from("FailedLogs"),
            rotation: Rotation::Hourly,
            tick: default_tick(),
            trigger_size: 1000,
            trigger_interval: "10s".to_string(),
            write_chunk: default_write_chunk(),
        }
    }

    /// Bulk ingest failures: daily files, 100 entries or 60 seconds.
    pub fn failed_documents() -> Self {
        Self {
            base_folder: PathBuf::from("FailedEcsLogs"),
            rotation: Rotation::Daily,
            tick: default_tick(),
            trigger_size: 100,
            trigger_interval: "60s".to_string(),
            write_chunk: default_write_chunk(),
        }
    }

    pub fn for_testing(self) -> Self {
        Self {
            tick: "10ms".to_string(),
            trigger_size: 10,
            trigger_interval: "50ms".to_string(),
            ..self
        }
    }

    pub fn tick_duration(&self) -> Duration {
        duration_or(&self.tick, Duration::from_millis(100))
    }

    pub fn batch_config(&self) -> crate::batch::BatchConfig {
        crate::batch::BatchConfig {
            max_batch_size: self.trigger_size.max(1),
            max_batch_delay: duration_or(&self.trigger_interval, Duration::from_secs(10)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplayConfig / RetentionConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_replay_interval")]
    pub interval: String,
    /// Days back from today whose journal buckets are scanned.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Files larger than this are skipped with a warning.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Upper bound for concurrent re-publishes.
    #[serde(default = "default_replay_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
    /// Also replay the failed-document journal back into the store.
    #[serde(default)]
    pub documents_enabled: bool,
}

fn default_replay_interval() -> String {
    "15m".to_string()
}
fn default_lookback_days() -> u32 {
    3
}
fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_replay_parallelism() -> usize {
    20
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_replay_interval(),
            lookback_days: default_lookback_days(),
            max_file_bytes: default_max_file_bytes(),
            parallelism: default_replay_parallelism(),
            rate_limit_per_sec: None,
            documents_enabled: false,
        }
    }
}

impl ReplayConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: "100ms".to_string(),
            parallelism: 4,
            ..Self::default()
        }
    }

    pub fn interval_duration(&self) -> Duration {
        duration_or(&self.interval, Duration::from_secs(15 * 60))
    }

    /// Concurrency for a file with `line_count` lines: a third of
    /// `min(line_count, parallelism)`, at least one.
    pub fn workers_for(&self, line_count: usize) -> usize {
        (line_count.min(self.parallelism) / 3).max(1)
    }

    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_per_sec.map(RateLimitConfig::per_second)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval")]
    pub interval: String,
    /// How far back the sweep looks, in days.
    #[serde(default = "default_scan_days")]
    pub scan_days: u32,
    /// Most recent days never deleted (replay still works on them).
    #[serde(default = "default_keep_recent_days")]
    pub keep_recent_days: u32,
}

fn default_retention_interval() -> String {
    "1h".to_string()
}
fn default_scan_days() -> u32 {
    7
}
fn default_keep_recent_days() -> u32 {
    3
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_retention_interval(),
            scan_days: default_scan_days(),
            keep_recent_days: default_keep_recent_days(),
        }
    }
}

impl RetentionConfig {
    pub fn interval_duration(&self) -> Duration {
        duration_or(&self.interval, Duration::from_secs(3600))
    }
}
