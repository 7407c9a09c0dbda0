//! Deletes journal buckets that aged out of the replay window.

use super::{tmp_path, JournalLayout};
use crate::config::RetentionConfig;
use crate::metrics;
use crate::resilience;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct RetentionWorker {
    name: String,
    layout: JournalLayout,
    config: RetentionConfig,
}

impl RetentionWorker {
    pub fn new(name: impl Into<String>, layout: JournalLayout, config: &RetentionConfig) -> Self {
        Self {
            name: name.into(),
            layout,
            config: config.clone(),
        }
    }

    /// Delete every bucket between `scan_days` and `keep_recent_days` ago.
    /// Returns how many files were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut deleted = 0;
        for path in self
            .layout
            .retention_candidates(now, self.config.scan_days, self.config.keep_recent_days)
        {
            for candidate in [tmp_path(&path), path] {
                match fs::remove_file(&candidate).await {
                    Ok(()) => {
                        debug!(journal = %self.name, path = %candidate.display(), "Deleted expired journal file");
                        deleted += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(journal = %self.name, path = %candidate.display(), error = %e, "Could not delete expired journal file")
                    }
                }
            }
        }

        if deleted > 0 {
            info!(journal = %self.name, deleted, "Retention sweep removed expired journal files");
            metrics::record_retention_deleted(&self.name, deleted);
        }
        deleted
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval_duration());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = resilience::shutdown_signal(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = info_span!("retention", journal = %self.name);
        tokio::spawn(self.run(shutdown).instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Rotation;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::path::{Path, PathBuf};

    fn touch(layout: &JournalLayout, at: DateTime<Utc>) -> PathBuf {
        let path = layout.path_for(at);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "x\n").unwrap();
        path
    }

    fn exists(path: &Path) -> bool {
        path.exists()
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_window() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JournalLayout::new(dir.path(), Rotation::Hourly);
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        let expired = touch(&layout, now - ChronoDuration::days(5));
        std::fs::write(tmp_path(&expired), "y\n").unwrap();
        let recent = touch(&layout, now - ChronoDuration::days(1));
        let ancient = touch(&layout, now - ChronoDuration::days(30));

        let worker = RetentionWorker::new("failed_logs", layout, &RetentionConfig::default());
        assert_eq!(worker.sweep(now).await, 2);

        assert!(!exists(&expired));
        assert!(!exists(&tmp_path(&expired)));
        assert!(exists(&recent));
        assert!(exists(&ancient), "outside the scan window");
    }

    #[tokio::test]
    async fn test_sweep_on_empty_folder() {
        let dir = tempfile::tempdir().unwrap();
        let worker = RetentionWorker::new(
            "failed_logs",
            JournalLayout::new(dir.path(), Rotation::Hourly),
            &RetentionConfig::default(),
        );
        assert_eq!(worker.sweep(Utc::now()).await, 0);
    }
}
