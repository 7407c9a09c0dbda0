//! Append-only, time-bucketed JSON-lines journal on local disk.
//!
//! Everything the pipeline could not deliver lands here: events the central
//! sink failed to publish, documents the store rejected. A background
//! [`replay`] worker periodically re-submits closed buckets, and a
//! [`retention`] worker deletes buckets past their age.
//!
//! # Layout
//!
//! ```text
//! Hourly:  {base}/2026/03/14/log-20260314-09.log
//! Daily:   {base}/failed-ecs-logs-20260314.log
//! ```
//!
//! A bucket is *active* while the wall clock is inside it. Only closed
//! buckets are replayed, so the writer and the replayer never touch the
//! same file.

pub mod archive;
pub mod replay;
pub mod retention;

use crate::document::FailedDocument;
use crate::error::{PipelineError, Result};
use crate::event::LogEvent;
use crate::metrics;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    Daily,
}

impl Rotation {
    fn step(&self) -> ChronoDuration {
        match self {
            Rotation::Hourly => ChronoDuration::hours(1),
            Rotation::Daily => ChronoDuration::days(1),
        }
    }
}

/// Midnight UTC of the day containing `at`.
pub fn midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Maps instants to journal file paths.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalLayout {
    base: PathBuf,
    rotation: Rotation,
}

impl JournalLayout {
    pub fn new(base: impl Into<PathBuf>, rotation: Rotation) -> Self {
        Self {
            base: base.into(),
            rotation,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Start of the bucket containing `at`.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self.rotation {
            Rotation::Hourly => at.duration_trunc(ChronoDuration::hours(1)).unwrap_or(at),
            Rotation::Daily => midnight(at),
        }
    }

    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        match self.rotation {
            Rotation::Hourly => self
                .base
                .join(at.format("%Y").to_string())
                .join(at.format("%m").to_string())
                .join(at.format("%d").to_string())
                .join(format!("log-{}.log", at.format("%Y%m%d-%H"))),
            Rotation::Daily => self.base.join(format!("failed-ecs-logs-{}.log", at.format("%Y%m%d"))),
        }
    }

    /// Paths of every bucket starting in `[from, to)`, oldest first.
    pub fn paths_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<PathBuf> {
        let step = self.rotation.step();
        let mut cursor = self.bucket_start(from);
        let mut paths = Vec::new();
        while cursor < to {
            paths.push(self.path_for(cursor));
            cursor += step;
        }
        paths
    }

    /// Whether `path` is the bucket being written at `now`.
    pub fn is_active(&self, path: &Path, now: DateTime<Utc>) -> bool {
        self.path_for(now) == path
    }

    /// Closed buckets from midnight `lookback_days` ago up to, not including,
    /// the active one.
    pub fn replay_candidates(&self, now: DateTime<Utc>, lookback_days: u32) -> Vec<PathBuf> {
        let from = midnight(now - ChronoDuration::days(i64::from(lookback_days)));
        self.paths_between(from, self.bucket_start(now))
    }

    /// Buckets from midnight `scan_days` ago up to midnight `keep_recent_days` ago.
    pub fn retention_candidates(&self, now: DateTime<Utc>, scan_days: u32, keep_recent_days: u32) -> Vec<PathBuf> {
        let from = midnight(now - ChronoDuration::days(i64::from(scan_days)));
        let to = midnight(now - ChronoDuration::days(i64::from(keep_recent_days)));
        self.paths_between(from, to)
    }
}

/// Sidecar used while rewriting a partially replayed file.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// A record that can be journaled and replayed.
pub trait JournalEntry: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Ordering key within a write.
    fn timestamp(&self) -> DateTime<Utc>;
}

impl JournalEntry for LogEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl JournalEntry for FailedDocument {
    fn timestamp(&self) -> DateTime<Utc> {
        self.document.timestamp
    }
}

/// Appends lines to the bucket for the current instant, rotating as the
/// clock crosses bucket boundaries.
pub struct JournalWriter {
    name: String,
    layout: JournalLayout,
    current: Option<(PathBuf, File)>,
}

impl JournalWriter {
    pub fn new(name: impl Into<String>, layout: JournalLayout) -> Self {
        Self {
            name: name.into(),
            layout,
            current: None,
        }
    }

    pub fn layout(&self) -> &JournalLayout {
        &self.layout
    }

    /// Path of the file currently held open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(path, _)| path.as_path())
    }

    /// Append one line per entry to the bucket for `now`.
    pub async fn append(&mut self, lines: &[String], now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.layout.path_for(now);
        if lines.is_empty() {
            return Ok(path);
        }

        let mut buffer = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buffer.push_str(line);
            buffer.push('\n');
        }

        let result = self.write_buffer(&path, buffer.as_bytes()).await;
        if result.is_err() {
            // Reopen on the next append
            self.current = None;
        } else {
            metrics::record_journal_write(&self.name, lines.len());
        }
        result.map(|()| path)
    }

    /// Serialize and append entries.
    pub async fn append_entries<T: Serialize>(&mut self, entries: &[T], now: DateTime<Utc>) -> Result<PathBuf> {
        let lines = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.append(&lines, now).await
    }

    async fn write_buffer(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        let reopen = !matches!(&self.current, Some((current, _)) if current == path);
        if reopen {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PipelineError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| PipelineError::io(path, e))?;
            debug!(journal = %self.name, path = %path.display(), "Journal rotated");
            self.current = Some((path.to_path_buf(), file));
        }

        if let Some((_, file)) = self.current.as_mut() {
            file.write_all(bytes).await.map_err(|e| PipelineError::io(path, e))?;
            file.flush().await.map_err(|e| PipelineError::io(path, e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("current", &self.current_path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_hourly_path_format() {
        let layout = JournalLayout::new("FailedLogs", Rotation::Hourly);
        assert_eq!(
            layout.path_for(at(2026, 3, 4, 9, 41)),
            PathBuf::from("FailedLogs/2026/03/04/log-20260304-09.log")
        );
    }

    #[test]
    fn test_daily_path_format() {
        let layout = JournalLayout::new("FailedEcsLogs", Rotation::Daily);
        assert_eq!(
            layout.path_for(at(2026, 3, 4, 23, 59)),
            PathBuf::from("FailedEcsLogs/failed-ecs-logs-20260304.log")
        );
    }

    #[test]
    fn test_bucket_start() {
        let hourly = JournalLayout::new("x", Rotation::Hourly);
        let daily = JournalLayout::new("x", Rotation::Daily);
        assert_eq!(hourly.bucket_start(at(2026, 3, 4, 9, 41)), at(2026, 3, 4, 9, 0));
        assert_eq!(daily.bucket_start(at(2026, 3, 4, 9, 41)), at(2026, 3, 4, 0, 0));
    }

    #[test]
    fn test_replay_candidates_exclude_active_bucket() {
        let layout = JournalLayout::new("x", Rotation::Hourly);
        let now = at(2026, 3, 4, 9, 41);
        let candidates = layout.replay_candidates(now, 3);

        // Three full days plus the nine closed hours of today
        assert_eq!(candidates.len(), 3 * 24 + 9);
        assert_eq!(candidates[0], layout.path_for(at(2026, 3, 1, 0, 0)));
        assert_eq!(candidates.last(), Some(&layout.path_for(at(2026, 3, 4, 8, 0))));
        assert!(!candidates.contains(&layout.path_for(now)));
    }

    #[test]
    fn test_daily_replay_candidates() {
        let layout = JournalLayout::new("x", Rotation::Daily);
        let candidates = layout.replay_candidates(at(2026, 3, 4, 9, 41), 3);
        assert_eq!(
            candidates,
            vec![
                layout.path_for(at(2026, 3, 1, 0, 0)),
                layout.path_for(at(2026, 3, 2, 0, 0)),
                layout.path_for(at(2026, 3, 3, 0, 0)),
            ]
        );
    }

    #[test]
    fn test_retention_window() {
        let layout = JournalLayout::new("x", Rotation::Hourly);
        let candidates = layout.retention_candidates(at(2026, 3, 10, 12, 0), 7, 3);

        assert_eq!(candidates.len(), 4 * 24);
        assert_eq!(candidates[0], layout.path_for(at(2026, 3, 3, 0, 0)));
        assert_eq!(candidates.last(), Some(&layout.path_for(at(2026, 3, 6, 23, 0))));
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("a/b/log-20260304-09.log")),
            PathBuf::from("a/b/log-20260304-09.log.tmp")
        );
    }

    #[tokio::test]
    async fn test_writer_appends_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JournalWriter::new("t", JournalLayout::new(dir.path(), Rotation::Hourly));

        let first = writer.append(&["a".into(), "b".into()], at(2026, 3, 4, 9, 0)).await.unwrap();
        writer.append(&["c".into()], at(2026, 3, 4, 9, 30)).await.unwrap();
        let second = writer.append(&["d".into()], at(2026, 3, 4, 10, 5)).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(writer.current_path(), Some(second.as_path()));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "a\nb\nc\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "d\n");
    }

    #[tokio::test]
    async fn test_append_entries_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JournalWriter::new("t", JournalLayout::new(dir.path(), Rotation::Daily));
        let event = LogEvent::new("A", crate::event::Level::Warning, "src", "hello");

        let path = writer.append_entries(&[event.clone()], Utc::now()).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: LogEvent = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(parsed, event);
    }
}
