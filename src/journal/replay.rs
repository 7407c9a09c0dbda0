//! Periodic re-submission of closed journal buckets.
//!
//! # Per-file protocol
//!
//! ```text
//! stale {file}.tmp? ──▶ delete it
//! missing / active / oversized ──▶ skip
//! read non-blank lines ──▶ deliver each (bounded concurrency, optional rate limit)
//!      │
//!      ├─ all delivered      ──▶ delete file
//!      ├─ some failed        ──▶ failed lines → {file}.tmp, fsync, rename over file
//!      ├─ all failed         ──▶ leave file untouched
//!      └─ shutdown mid-pass  ──▶ leave file untouched
//! ```
//!
//! Redelivery is at-least-once: a crash between delivering and rewriting
//! replays the same lines again on the next pass.

use super::{tmp_path, JournalLayout};
use crate::broker::BoxFuture;
use crate::config::ReplayConfig;
use crate::document::FailedDocument;
use crate::error::{PipelineError, Result};
use crate::event::LogEvent;
use crate::ingest::store::{BulkOperation, BulkRequest, BulkStore};
use crate::metrics;
use crate::resilience::{self, RateLimiter};
use crate::sink::central::CentralWriter;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Where replayed lines are delivered.
pub trait ReplayTarget: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Parse and re-submit one journal line.
    fn deliver<'a>(&'a self, line: &'a str) -> BoxFuture<'a, ()>;
}

/// Re-publishes failed central log events to the broker.
pub struct BrokerReplayTarget {
    writer: Arc<CentralWriter>,
}

impl BrokerReplayTarget {
    pub fn new(writer: Arc<CentralWriter>) -> Self {
        Self { writer }
    }
}

impl ReplayTarget for BrokerReplayTarget {
    fn name(&self) -> &str {
        "broker"
    }

    fn deliver<'a>(&'a self, line: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let event: LogEvent = serde_json::from_str(line)?;
            self.writer.publish(&event).await.map(|_| ())
        })
    }
}

/// Re-indexes failed documents into the store, one request per line.
pub struct StoreReplayTarget {
    store: Arc<dyn BulkStore>,
}

impl StoreReplayTarget {
    pub fn new(store: Arc<dyn BulkStore>) -> Self {
        Self { store }
    }
}

impl ReplayTarget for StoreReplayTarget {
    fn name(&self) -> &str {
        "store"
    }

    fn deliver<'a>(&'a self, line: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let failed: FailedDocument = serde_json::from_str(line)?;
            let index = failed.index.clone();
            let document = failed.into_document();
            let request = BulkRequest::new(index, vec![BulkOperation::from_document(&document)?]);

            let response = self.store.bulk(&request).await?;
            if response.has_failures() {
                return Err(PipelineError::store(
                    response.first_error().unwrap_or("item rejected").to_string(),
                    None,
                ));
            }
            Ok(())
        })
    }
}

/// What happened to one journal file in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Missing,
    Skipped(&'static str),
    /// Every line delivered; file removed.
    Deleted { replayed: usize },
    /// Some lines failed; file now holds only those.
    Rewritten { replayed: usize, failed: usize },
    /// Nothing delivered; file left as it was.
    Untouched { failed: usize },
    /// Shutdown interrupted the file.
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Candidate files that existed.
    pub files: usize,
    pub skipped: usize,
    pub replayed: usize,
    pub failed: usize,
    pub deleted: usize,
    pub rewritten: usize,
}

pub struct ReplayWorker {
    name: String,
    layout: JournalLayout,
    target: Arc<dyn ReplayTarget>,
    config: ReplayConfig,
    limiter: Option<Arc<RateLimiter>>,
}

impl ReplayWorker {
    pub fn new(name: impl Into<String>, layout: JournalLayout, target: Arc<dyn ReplayTarget>, config: &ReplayConfig) -> Self {
        Self {
            name: name.into(),
            layout,
            target,
            limiter: config.rate_limit_config().map(|rate| Arc::new(RateLimiter::new(rate))),
            config: config.clone(),
        }
    }

    /// Replay every closed bucket in the lookback window, oldest first.
    pub async fn run_pass(&self, now: DateTime<Utc>, shutdown: &mut watch::Receiver<bool>) -> ReplayReport {
        let mut report = ReplayReport::default();
        for path in self.layout.replay_candidates(now, self.config.lookback_days) {
            if *shutdown.borrow() {
                break;
            }
            let outcome = match self.replay_file(&path, now, shutdown).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(journal = %self.name, path = %path.display(), error = %e, "Replay of journal file failed");
                    continue;
                }
            };

            if outcome != FileOutcome::Missing {
                report.files += 1;
            }
            match outcome {
                FileOutcome::Missing => {}
                FileOutcome::Skipped(_) => report.skipped += 1,
                FileOutcome::Deleted { replayed } => {
                    report.replayed += replayed;
                    report.deleted += 1;
                }
                FileOutcome::Rewritten { replayed, failed } => {
                    report.replayed += replayed;
                    report.failed += failed;
                    report.rewritten += 1;
                }
                FileOutcome::Untouched { failed } => report.failed += failed,
                FileOutcome::Aborted => break,
            }
        }

        if report.files > 0 {
            info!(
                journal = %self.name,
                target = self.target.name(),
                files = report.files,
                replayed = report.replayed,
                failed = report.failed,
                "Replay pass complete"
            );
        }
        report
    }

    pub async fn replay_file(
        &self,
        path: &Path,
        now: DateTime<Utc>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<FileOutcome> {
        let tmp = tmp_path(path);
        if fs::try_exists(&tmp).await.unwrap_or(false) {
            debug!(path = %tmp.display(), "Removing stale rewrite file");
            fs::remove_file(&tmp).await.map_err(|e| PipelineError::io(&tmp, e))?;
        }

        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileOutcome::Missing),
            Err(e) => return Err(PipelineError::io(path, e)),
        };
        if self.layout.is_active(path, now) {
            metrics::record_replay_skipped(&self.name, "active");
            return Ok(FileOutcome::Skipped("active"));
        }
        if metadata.len() > self.config.max_file_bytes {
            warn!(
                journal = %self.name,
                path = %path.display(),
                bytes = metadata.len(),
                max_bytes = self.config.max_file_bytes,
                "Journal file too large to replay, skipping"
            );
            metrics::record_replay_skipped(&self.name, "too_large");
            return Ok(FileOutcome::Skipped("too_large"));
        }

        let content = fs::read_to_string(path).await.map_err(|e| PipelineError::io(path, e))?;
        let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();
        if lines.is_empty() {
            fs::remove_file(path).await.map_err(|e| PipelineError::io(path, e))?;
            return Ok(FileOutcome::Deleted { replayed: 0 });
        }

        let workers = self.config.workers_for(lines.len());
        // Each delivery owns its line so the pass stays `Send + 'static` under `tokio::spawn`.
        let deliveries: Vec<_> = lines
            .iter()
            .enumerate()
            .map(|(pos, line)| {
                let target = self.target.clone();
                let limiter = self.limiter.clone();
                let journal = self.name.clone();
                let line = line.to_string();
                async move {
                    if let Some(limiter) = limiter {
                        limiter.acquire().await;
                    }
                    let result = target.deliver(&line).await;
                    if let Err(e) = &result {
                        debug!(journal = %journal, line = pos + 1, error = %e, "Line not replayed");
                    }
                    (pos, result.is_ok())
                }
                .boxed()
            })
            .collect();
        let deliveries = stream::iter(deliveries).buffered(workers).collect::<Vec<_>>();

        let results = tokio::select! {
            biased;
            _ = resilience::shutdown_signal(shutdown) => {
                info!(journal = %self.name, path = %path.display(), "Replay interrupted by shutdown, file left as is");
                return Ok(FileOutcome::Aborted);
            }
            results = deliveries => results,
        };

        let failed: Vec<&str> = results.iter().filter(|(_, ok)| !ok).map(|(pos, _)| lines[*pos]).collect();
        let replayed = lines.len() - failed.len();
        metrics::record_replay_file(&self.name, replayed, failed.len());

        if failed.is_empty() {
            fs::remove_file(path).await.map_err(|e| PipelineError::io(path, e))?;
            debug!(journal = %self.name, path = %path.display(), replayed, "Journal file fully replayed");
            return Ok(FileOutcome::Deleted { replayed });
        }
        if replayed == 0 {
            warn!(journal = %self.name, path = %path.display(), failed = failed.len(), "No line replayed, file kept");
            return Ok(FileOutcome::Untouched { failed: failed.len() });
        }

        self.rewrite(path, &tmp, &failed).await?;
        warn!(journal = %self.name, path = %path.display(), replayed, failed = failed.len(), "Journal file partially replayed");
        Ok(FileOutcome::Rewritten {
            replayed,
            failed: failed.len(),
        })
    }

    /// Replace `path` with `lines` through a synced sidecar.
    async fn rewrite(&self, path: &Path, tmp: &Path, lines: &[&str]) -> Result<()> {
        let mut body = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }

        let mut file = fs::File::create(tmp).await.map_err(|e| PipelineError::io(tmp, e))?;
        file.write_all(body.as_bytes()).await.map_err(|e| PipelineError::io(tmp, e))?;
        file.flush().await.map_err(|e| PipelineError::io(tmp, e))?;
        file.sync_all().await.map_err(|e| PipelineError::io(tmp, e))?;
        drop(file);

        fs::rename(tmp, path).await.map_err(|e| PipelineError::io(path, e))
    }

    /// Run a pass every interval until shutdown. The first pass waits one interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.interval_duration();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = resilience::shutdown_signal(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.run_pass(Utc::now(), &mut shutdown).await;
                }
            }
        }
        debug!(journal = %self.name, "Replay worker stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = info_span!("replay", journal = %self.name);
        tokio::spawn(self.run(shutdown).instrument(span))
    }
}

impl std::fmt::Debug for ReplayWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWorker")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("target", &self.target.name())
            .finish()
    }
}
