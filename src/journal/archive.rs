//! Drains a warehouse into the journal on a size-or-time trigger.

use super::{JournalEntry, JournalLayout, JournalWriter};
use crate::batch::FlushTrigger;
use crate::config::JournalConfig;
use crate::error::Result;
use crate::resilience;
use crate::warehouse::Warehouse;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub struct ArchiveWorker<T> {
    name: String,
    warehouse: Arc<Warehouse<T>>,
    writer: JournalWriter,
    trigger: FlushTrigger,
    tick: Duration,
    write_chunk: usize,
}

impl<T: JournalEntry> ArchiveWorker<T> {
    pub fn new(name: impl Into<String>, warehouse: Arc<Warehouse<T>>, config: &JournalConfig) -> Self {
        let name = name.into();
        Self {
            writer: JournalWriter::new(name.clone(), JournalLayout::new(&config.base_folder, config.rotation)),
            name,
            warehouse,
            trigger: FlushTrigger::new(config.batch_config()),
            tick: config.tick_duration(),
            write_chunk: config.write_chunk.max(1),
        }
    }

    pub fn layout(&self) -> &JournalLayout {
        self.writer.layout()
    }

    /// Drain the warehouse and append everything, oldest first.
    ///
    /// On a write error the unwritten entries go back into the warehouse.
    pub async fn flush(&mut self) -> Result<usize> {
        let Some(mut entries) = self.warehouse.drain() else {
            return Ok(0);
        };
        if entries.is_empty() {
            return Ok(0);
        }
        entries.sort_by_key(|e| e.timestamp());

        let total = entries.len();
        let mut written = 0;
        while written < total {
            let end = (written + self.write_chunk).min(total);
            let mut lines = Vec::with_capacity(end - written);
            for entry in &entries[written..end] {
                match serde_json::to_string(entry) {
                    Ok(line) => lines.push(line),
                    Err(e) => warn!(journal = %self.name, error = %e, "Skipping unserializable entry"),
                }
            }

            if let Err(e) = self.writer.append(&lines, Utc::now()).await {
                let requeued = total - written;
                self.warehouse.push_many(entries.into_iter().skip(written));
                error!(journal = %self.name, error = %e, requeued, "Journal write failed, entries requeued");
                return Err(e);
            }
            written = end;
        }

        debug!(journal = %self.name, written, "Journal flushed");
        Ok(written)
    }

    /// Tick until shutdown, then flush whatever is left.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = resilience::shutdown_signal(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if self.trigger.should_flush(self.warehouse.len()) {
                        let _ = self.flush().await;
                        self.trigger.mark_flushed();
                    }
                }
            }
        }

        match self.flush().await {
            Ok(written) => info!(journal = %self.name, written, "Archive worker stopped"),
            Err(e) => error!(journal = %self.name, error = %e, pending = self.warehouse.len(), "Final journal flush failed"),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = info_span!("archive", journal = %self.name);
        tokio::spawn(self.run(shutdown).instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Level, LogEvent};
    use crate::journal::Rotation;
    use chrono::Duration as ChronoDuration;

    fn config(dir: &std::path::Path) -> JournalConfig {
        JournalConfig {
            base_folder: dir.to_path_buf(),
            rotation: Rotation::Hourly,
            ..JournalConfig::failed_logs()
        }
        .for_testing()
    }

    fn read_all(dir: &std::path::Path) -> Vec<LogEvent> {
        let layout = JournalLayout::new(dir, Rotation::Hourly);
        let content = std::fs::read_to_string(layout.path_for(Utc::now())).unwrap();
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_flush_sorts_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(Warehouse::new("failed_logs"));
        let now = Utc::now();
        warehouse.push(LogEvent::new("A", Level::Error, "s", "second").at(now));
        warehouse.push(LogEvent::new("A", Level::Error, "s", "first").at(now - ChronoDuration::seconds(5)));

        let mut worker = ArchiveWorker::new("failed_logs", warehouse.clone(), &config(dir.path()));
        assert_eq!(worker.flush().await.unwrap(), 2);
        assert!(warehouse.is_empty());

        let messages: Vec<_> = read_all(dir.path()).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_write_error_requeues_entries() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the base folder should be makes every write fail
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();

        let warehouse = Arc::new(Warehouse::new("failed_logs"));
        warehouse.push(LogEvent::new("A", Level::Error, "s", "m"));

        let mut worker = ArchiveWorker::new("failed_logs", warehouse.clone(), &config(&blocker));
        assert!(worker.flush().await.is_err());
        assert_eq!(warehouse.len(), 1);
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(Warehouse::new("failed_logs"));
        let (tx, rx) = watch::channel(false);
        let handle = ArchiveWorker::new("failed_logs", warehouse.clone(), &config(dir.path())).spawn(rx);

        warehouse.push(LogEvent::new("A", Level::Error, "s", "late"));
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(read_all(dir.path()).len(), 1);
    }
}
