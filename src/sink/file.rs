//! Local file sink writer: hourly JSON-lines files under a base folder.

use super::SinkWriter;
use crate::broker::BoxFuture;
use crate::config::FileSinkConfig;
use crate::error::Result;
use crate::event::LogEvent;
use crate::journal::{JournalLayout, JournalWriter, Rotation};
use chrono::Utc;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::error;

/// Buffers rendered lines and appends them in batches.
///
/// A batch is written once `write_size` lines are pending, and on every
/// `write_interval` tick driven by the owning sink.
pub struct FileWriter {
    lines: SegQueue<String>,
    pending: AtomicUsize,
    write_size: usize,
    write_interval: Duration,
    journal: Mutex<JournalWriter>,
}

impl FileWriter {
    pub fn new(config: &FileSinkConfig) -> Self {
        Self::with_layout(
            JournalLayout::new(&config.base_folder, Rotation::Hourly),
            config.write_size,
            config.write_interval_duration(),
        )
    }

    pub fn with_layout(layout: JournalLayout, write_size: usize, write_interval: Duration) -> Self {
        Self {
            lines: SegQueue::new(),
            pending: AtomicUsize::new(0),
            write_size: write_size.max(1),
            write_interval,
            journal: Mutex::new(JournalWriter::new("file", layout)),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn push_line(&self, line: String) -> usize {
        self.lines.push(line);
        self.pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn write_pending(&self) -> Result<()> {
        let mut journal = self.journal.lock().await;
        let mut batch = Vec::with_capacity(self.pending());
        while let Some(line) = self.lines.pop() {
            batch.push(line);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.pending.fetch_sub(batch.len(), Ordering::AcqRel);

        if let Err(e) = journal.append(&batch, Utc::now()).await {
            error!(error = %e, lines = batch.len(), "File sink write failed, lines kept for the next flush");
            for line in batch {
                self.push_line(line);
            }
            return Err(e);
        }
        Ok(())
    }
}

impl SinkWriter<LogEvent> for FileWriter {
    fn process<'a>(&'a self, item: &'a LogEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let line = serde_json::to_string(item)?;
            if self.push_line(line) >= self.write_size {
                // The line is buffered either way; a failed write is retried on the next flush
                let _ = self.write_pending().await;
            }
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.write_pending())
    }

    fn flush_interval(&self) -> Option<Duration> {
        Some(self.write_interval)
    }
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("pending", &self.pending())
            .field("write_size", &self.write_size)
            .field("write_interval", &self.write_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use crate::sink::BoundedSink;
    use std::sync::Arc;

    fn read_current(dir: &std::path::Path) -> Vec<String> {
        let path = JournalLayout::new(dir, Rotation::Hourly).path_for(Utc::now());
        std::fs::read_to_string(path)
            .map(|c| c.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_writes_once_write_size_reached() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::with_layout(
            JournalLayout::new(dir.path(), Rotation::Hourly),
            3,
            Duration::from_secs(3600),
        );

        for i in 0..2 {
            writer.process(&LogEvent::new("A", Level::Information, "s", format!("m{}", i))).await.unwrap();
        }
        assert!(read_current(dir.path()).is_empty());
        assert_eq!(writer.pending(), 2);

        writer.process(&LogEvent::new("A", Level::Information, "s", "m2")).await.unwrap();
        assert_eq!(read_current(dir.path()).len(), 3);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn test_interval_flush_through_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileSinkConfig::for_testing(dir.path());
        let sink = BoundedSink::builder("file", Arc::new(FileWriter::new(&config)) as Arc<dyn SinkWriter<LogEvent>>)
            .build();
        sink.start().unwrap();

        sink.write(LogEvent::new("A", Level::Information, "s", "only one"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while read_current(dir.path()).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        sink.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(read_current(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_lines() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        let writer = FileWriter::with_layout(JournalLayout::new(&blocker, Rotation::Hourly), 1, Duration::from_secs(1));

        writer.process(&LogEvent::new("A", Level::Information, "s", "m")).await.unwrap();
        assert_eq!(writer.pending(), 1);
        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending(), 1);
    }
}
