//! Event builders, wait helpers and recording test doubles.

use log_pipeline::broker::memory::MemoryBroker;
use log_pipeline::broker::BoxFuture;
use log_pipeline::journal::replay::ReplayTarget;
use log_pipeline::journal::JournalLayout;
use log_pipeline::sink::SinkWriter;
use log_pipeline::{Level, LogEvent, LogPipeline, MemoryStore, PipelineConfig, PipelineError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn event(stream_key: &str, message: &str) -> LogEvent {
    LogEvent::new(stream_key, Level::Information, format!("{}.Api", stream_key), message)
}

pub fn event_at(stream_key: &str, message: &str, at: DateTime<Utc>) -> LogEvent {
    event(stream_key, message).at(at)
}

/// Pipeline over in-memory doubles, journals under `root`.
pub fn memory_pipeline(root: &Path, broker: &MemoryBroker, store: &MemoryStore) -> LogPipeline {
    LogPipeline::new(
        PipelineConfig::for_testing(root, "Orders"),
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
    )
    .expect("test config is valid")
}

/// Poll `condition` every 10ms; panics after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {:?}", timeout);
}

/// Write `lines` into the journal bucket that covers `at`.
pub fn write_journal(layout: &JournalLayout, at: DateTime<Utc>, lines: &[String]) -> PathBuf {
    let path = layout.path_for(at);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(&path, body).unwrap();
    path
}

// =============================================================================
// Recording sink writer
// =============================================================================

/// Collects processed events; fails every item while `failing` is set.
#[derive(Default)]
pub struct RecordingWriter {
    pub seen: Mutex<Vec<LogEvent>>,
    pub failing: AtomicBool,
    pub flushes: AtomicUsize,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let writer = Self::default();
        writer.failing.store(true, Ordering::SeqCst);
        Arc::new(writer)
    }

    pub fn messages(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|e| e.message.clone()).collect()
    }
}

impl SinkWriter<LogEvent> for RecordingWriter {
    fn process<'a>(&'a self, item: &'a LogEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PipelineError::broker("basic.publish", "broker unreachable"));
            }
            self.seen.lock().unwrap().push(item.clone());
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

// =============================================================================
// Scripted replay target
// =============================================================================

/// Fails every line listed in `rejected`; records the rest.
#[derive(Default)]
pub struct ScriptedTarget {
    rejected: Mutex<HashSet<String>>,
    pub delivered: Mutex<Vec<String>>,
}

impl ScriptedTarget {
    pub fn rejecting<I: IntoIterator<Item = S>, S: Into<String>>(lines: I) -> Arc<Self> {
        let target = Self::default();
        target.rejected.lock().unwrap().extend(lines.into_iter().map(Into::into));
        Arc::new(target)
    }

    pub fn accept_all(&self) {
        self.rejected.lock().unwrap().clear();
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl ReplayTarget for ScriptedTarget {
    fn name(&self) -> &str {
        "scripted"
    }

    fn deliver<'a>(&'a self, line: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.rejected.lock().unwrap().contains(line) {
                return Err(PipelineError::Timeout(Duration::from_millis(1)));
            }
            self.delivered.lock().unwrap().push(line.to_string());
            Ok(())
        })
    }
}
