//! Producer-side entry point: filter, enrich, fan out to sinks.
//!
//! ```text
//! emit(event) ──▶ level filter (by source category) ──▶ enrich ──┬──▶ console sink
//!                                                                 ├──▶ file sink
//!                                                                 └──▶ central sink
//! ```
//!
//! Emitting never blocks: every sink write is a non-blocking enqueue.

use crate::config::{EmitterConfig, DEFAULT_CATEGORY};
use crate::event::{Level, LogEvent};
use crate::sink::{BoundedSink, WriteOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct LogEmitter {
    /// Category prefixes, longest first.
    levels: Vec<(String, Level)>,
    default_level: Level,
    enrichers: BTreeMap<String, String>,
    sinks: Vec<Arc<BoundedSink<LogEvent>>>,
}

impl LogEmitter {
    pub fn new(config: &EmitterConfig, sinks: Vec<Arc<BoundedSink<LogEvent>>>) -> Self {
        let default_level = config.levels.get(DEFAULT_CATEGORY).copied().unwrap_or_default();
        let mut levels: Vec<(String, Level)> = config
            .levels
            .iter()
            .filter(|(category, _)| category.as_str() != DEFAULT_CATEGORY)
            .map(|(category, level)| (category.clone(), *level))
            .collect();
        levels.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            levels,
            default_level,
            enrichers: config.enrichers.clone(),
            sinks,
        }
    }

    pub fn sinks(&self) -> &[Arc<BoundedSink<LogEvent>>] {
        &self.sinks
    }

    /// Minimum level for a category: the longest matching dotted prefix wins.
    pub fn min_level(&self, category: &str) -> Level {
        self.levels
            .iter()
            .find(|(prefix, _)| {
                category == prefix
                    || (category.starts_with(prefix.as_str()) && category[prefix.len()..].starts_with('.'))
            })
            .map(|(_, level)| *level)
            .unwrap_or(self.default_level)
    }

    pub fn is_enabled(&self, category: &str, level: Level) -> bool {
        let min = self.min_level(category);
        level != Level::None && min != Level::None && level >= min
    }

    /// Filter, enrich, and hand the event to every sink.
    ///
    /// Returns how many sinks accepted it (including with eviction).
    pub fn emit(&self, mut event: LogEvent) -> usize {
        if !self.is_enabled(&event.source, event.level) {
            return 0;
        }
        for (key, value) in &self.enrichers {
            event.enrichers.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let Some((last, rest)) = self.sinks.split_last() else {
            return 0;
        };
        let mut accepted = 0;
        for sink in rest {
            accepted += usize::from(accepted_outcome(sink.write(event.clone())));
        }
        accepted += usize::from(accepted_outcome(last.write(event)));
        accepted
    }

    pub fn log(&self, stream_key: &str, level: Level, source: &str, message: impl Into<String>) -> usize {
        self.emit(LogEvent::new(stream_key, level, source, message))
    }
}

fn accepted_outcome(outcome: WriteOutcome) -> bool {
    matches!(outcome, WriteOutcome::Accepted | WriteOutcome::DroppedOldest)
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter")
            .field("default_level", &self.default_level)
            .field("levels", &self.levels)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BoxFuture;
    use crate::sink::SinkWriter;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Collect(Mutex<Vec<LogEvent>>);

    impl SinkWriter<LogEvent> for Collect {
        fn process<'a>(&'a self, item: &'a LogEvent) -> BoxFuture<'a, ()> {
            self.0.lock().unwrap().push(item.clone());
            Box::pin(async { Ok(()) })
        }
    }

    fn config() -> EmitterConfig {
        EmitterConfig {
            levels: BTreeMap::from([
                ("Default".to_string(), Level::Information),
                ("Orders".to_string(), Level::Warning),
                ("Orders.Audit".to_string(), Level::Debug),
                ("Noisy".to_string(), Level::None),
            ]),
            enrichers: BTreeMap::from([("env".to_string(), "test".to_string())]),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let emitter = LogEmitter::new(&config(), vec![]);
        assert_eq!(emitter.min_level("Orders"), Level::Warning);
        assert_eq!(emitter.min_level("Orders.Api"), Level::Warning);
        assert_eq!(emitter.min_level("Orders.Audit.Trail"), Level::Debug);
        assert_eq!(emitter.min_level("OrdersX"), Level::Information);
        assert_eq!(emitter.min_level("Billing"), Level::Information);
    }

    #[test]
    fn test_none_disables_category() {
        let emitter = LogEmitter::new(&config(), vec![]);
        assert!(!emitter.is_enabled("Noisy.Thing", Level::Critical));
        assert!(emitter.is_enabled("Billing", Level::Information));
        assert!(!emitter.is_enabled("Billing", Level::Debug));
    }

    #[tokio::test]
    async fn test_emit_enriches_and_fans_out() {
        let a = Arc::new(Collect(Mutex::new(Vec::new())));
        let b = Arc::new(Collect(Mutex::new(Vec::new())));
        let sinks = vec![
            Arc::new(BoundedSink::builder("a", a.clone() as Arc<dyn SinkWriter<LogEvent>>).build()),
            Arc::new(BoundedSink::builder("b", b.clone() as Arc<dyn SinkWriter<LogEvent>>).build()),
        ];
        for sink in &sinks {
            sink.start().unwrap();
        }
        let emitter = LogEmitter::new(&config(), sinks.clone());

        assert_eq!(emitter.log("A", Level::Warning, "Orders.Api", "kept"), 2);
        assert_eq!(emitter.log("A", Level::Information, "Orders.Api", "filtered"), 0);
        let own = LogEvent::new("A", Level::Error, "Billing", "own label").with_enricher("env", "prod");
        emitter.emit(own);

        for sink in &sinks {
            sink.stop(Duration::from_secs(1)).await.unwrap();
        }
        for collected in [&a, &b] {
            let events = collected.0.lock().unwrap();
            assert_eq!(events.len(), 2);
            let kept = events.iter().find(|e| e.message == "kept").unwrap();
            assert_eq!(kept.enrichers.get("env").map(String::as_str), Some("test"));
            let own = events.iter().find(|e| e.message == "own label").unwrap();
            assert_eq!(own.enrichers.get("env").map(String::as_str), Some("prod"));
        }
    }
}
