//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use chrono::{DateTime, TimeZone, Utc};
use log_pipeline::broker::{topic_matches, BoxFuture};
use log_pipeline::codec;
use log_pipeline::ingest::index_name;
use log_pipeline::ingest::stats::{chunk_size, StreamSizeStats};
use log_pipeline::journal::{JournalLayout, Rotation};
use log_pipeline::sink::{BoundedSink, OverflowPolicy, SinkWriter};
use log_pipeline::Warehouse;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn instant(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

// 2020-01-01 .. 2030-01-01
fn any_instant() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000i64).prop_map(instant)
}

fn word() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

// =============================================================================
// Bounded Sink Overflow Properties
// =============================================================================

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<u32>>,
}

impl SinkWriter<u32> for Collect {
    fn process<'a>(&'a self, item: &'a u32) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(*item);
            Ok(())
        })
    }
}

/// Write `count` items into an idle sink, then start it and drain.
fn written_through(capacity: usize, count: u32, policy: OverflowPolicy) -> Vec<u32> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async {
        let writer = Arc::new(Collect::default());
        let sink = BoundedSink::<u32>::builder("prop", writer.clone())
            .capacity(capacity)
            .policy(policy)
            .build();
        for i in 0..count {
            sink.write(i);
        }
        sink.start().unwrap();
        sink.stop(Duration::from_secs(5)).await.unwrap();
        let seen = writer.seen.lock().unwrap().clone();
        seen
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Drop-oldest keeps exactly the newest `capacity` items, in order.
    #[test]
    fn drop_oldest_keeps_newest(capacity in 1usize..20, count in 0u32..60) {
        let seen = written_through(capacity, count, OverflowPolicy::DropOldest);
        let kept = (count as usize).min(capacity) as u32;
        let expected: Vec<u32> = (count - kept..count).collect();
        prop_assert_eq!(seen, expected);
    }

    /// Drop-newest keeps exactly the first `capacity` items, in order.
    #[test]
    fn drop_newest_keeps_oldest(capacity in 1usize..20, count in 0u32..60) {
        let seen = written_through(capacity, count, OverflowPolicy::DropNewest);
        let kept = (count as usize).min(capacity) as u32;
        let expected: Vec<u32> = (0..kept).collect();
        prop_assert_eq!(seen, expected);
    }
}

// =============================================================================
// Warehouse Properties
// =============================================================================

proptest! {
    /// Drain returns every pushed item exactly once, then nothing.
    #[test]
    fn warehouse_drain_returns_everything(items in prop::collection::vec(any::<u16>(), 0..200)) {
        let warehouse = Warehouse::new("prop");
        warehouse.push_many(items.clone());
        prop_assert_eq!(warehouse.len(), items.len());

        let mut drained = warehouse.drain().unwrap();
        drained.sort_unstable();
        let mut expected = items;
        expected.sort_unstable();
        prop_assert_eq!(drained, expected);
        prop_assert!(warehouse.is_empty());
        prop_assert_eq!(warehouse.drain().unwrap(), Vec::<u16>::new());
    }
}

// =============================================================================
// Adaptive Chunking Properties
// =============================================================================

proptest! {
    /// A chunk always holds at least one document.
    #[test]
    fn chunk_size_never_zero(budget in 0usize..10_000_000, average in 0.0f64..1e9) {
        prop_assert!(chunk_size(budget, average) >= 1);
    }

    /// A chunk of average documents fits the budget, unless one document alone exceeds it.
    #[test]
    fn chunk_size_fits_budget(budget in 1usize..10_000_000, average in 1.0f64..100_000.0) {
        let chunk = chunk_size(budget, average);
        if average <= budget as f64 {
            prop_assert!(chunk as f64 * average <= budget as f64 + 1e-6);
            prop_assert!((chunk + 1) as f64 * average > budget as f64 - 1e-6);
        } else {
            prop_assert_eq!(chunk, 1);
        }
    }

    /// Larger documents never produce larger chunks.
    #[test]
    fn chunk_size_monotonic(budget in 1usize..10_000_000, small in 1.0f64..10_000.0, extra in 0.0f64..10_000.0) {
        prop_assert!(chunk_size(budget, small) >= chunk_size(budget, small + extra));
    }

    /// Running stats match the batch mean, min and max.
    #[test]
    fn size_stats_track_mean_and_bounds(sizes in prop::collection::vec(1usize..100_000, 1..200)) {
        let mut stats = StreamSizeStats::default();
        for size in &sizes {
            stats.record(*size);
        }
        let mean = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;

        prop_assert_eq!(stats.count, sizes.len() as u64);
        prop_assert!((stats.average - mean).abs() < 1e-6 * mean.max(1.0));
        prop_assert_eq!(stats.min, *sizes.iter().min().unwrap());
        prop_assert_eq!(stats.max, *sizes.iter().max().unwrap());
    }
}

// =============================================================================
// Routing Properties
// =============================================================================

proptest! {
    /// A key always matches itself.
    #[test]
    fn topic_literal_matches_itself(words in prop::collection::vec(word(), 1..5)) {
        let key = words.join(".");
        prop_assert!(topic_matches(&key, &key));
    }

    /// `#` matches any key.
    #[test]
    fn topic_hash_matches_everything(words in prop::collection::vec(word(), 0..5)) {
        prop_assert!(topic_matches("#", &words.join(".")));
    }

    /// `*` matches exactly one word.
    #[test]
    fn topic_star_counts_words(words in prop::collection::vec(word(), 1..5)) {
        let key = words.join(".");
        let pattern = vec!["*"; words.len()].join(".");
        prop_assert!(topic_matches(&pattern, &key));

        let longer = format!("{}.*", pattern);
        prop_assert!(!topic_matches(&longer, &key));
    }

    /// The general binding picks up every general key and no specific one.
    #[test]
    fn general_binding_separates_streams(stream in word()) {
        let general = format!("project.{}.general", stream);
        let specific = format!("project.{}.specific", stream);
        prop_assert!(topic_matches("project.*.general", &general));
        prop_assert!(!topic_matches("project.*.general", &specific));
    }
}

// =============================================================================
// Journal Layout Properties
// =============================================================================

proptest! {
    /// Every instant maps to the same file as the start of its bucket.
    #[test]
    fn path_is_constant_within_bucket(at in any_instant(), daily in any::<bool>()) {
        let rotation = if daily { Rotation::Daily } else { Rotation::Hourly };
        let layout = JournalLayout::new("/journal", rotation);
        let start = layout.bucket_start(at);
        prop_assert!(start <= at);
        prop_assert_eq!(layout.path_for(at), layout.path_for(start));
    }

    /// Replay never touches the bucket still being written.
    #[test]
    fn replay_candidates_exclude_active(at in any_instant(), lookback in 0u32..7, daily in any::<bool>()) {
        let rotation = if daily { Rotation::Daily } else { Rotation::Hourly };
        let layout = JournalLayout::new("/journal", rotation);
        let candidates = layout.replay_candidates(at, lookback);
        let active = layout.path_for(at);
        prop_assert!(!candidates.contains(&active));
        prop_assert!(candidates.iter().all(|p| !layout.is_active(p, at)));
    }

    /// Index names are lower-case and carry the day.
    #[test]
    fn index_name_is_lowercase(stream in "[A-Za-z]{1,12}", at in any_instant()) {
        let index = index_name(&stream, at);
        prop_assert_eq!(index.clone(), index.to_lowercase());
        let suffix = at.format("-logs-%Y-%m-%d").to_string();
        prop_assert!(index.ends_with(&suffix));
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn decode_never_panics(body in prop::collection::vec(any::<u8>(), 0..512), compressed in any::<bool>()) {
        let _ = codec::decode::<serde_json::Value>(&body, compressed);
    }
}
