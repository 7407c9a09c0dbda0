//! Size-or-time flush trigger shared by the ingest engine and archive workers.
//!
//! # Design
//!
//! ```text
//! Warehouse ──▶ tick ──▶ FlushTrigger::should_flush(len) ──┬──▶ drain + flush
//!                         │                                 │
//!                         │ len >= max_batch_size           │ mark_flushed()
//!                         │ OR elapsed >= max_batch_delay   │
//!                         ▼                                 ▼
//!                       wait for next tick            timer restarts
//! ```
//!
//! The trigger bounds both worst-case latency (the delay) and worst-case
//! batch size (the count). Workers evaluate it on a fixed tick.

use std::time::Duration;
use tokio::time::Instant;

/// Thresholds for a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Pending entries that force a flush.
    pub max_batch_size: usize,
    /// Maximum time between flushes while entries are pending.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_batch_delay: Duration::from_secs(2),
        }
    }
}

impl BatchConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(20),
        }
    }
}

/// Tracks when the last flush happened and decides when the next one is due.
#[derive(Debug)]
pub struct FlushTrigger {
    config: BatchConfig,
    last_flush: Instant,
}

impl FlushTrigger {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            last_flush: Instant::now(),
        }
    }

    /// Whether `pending` entries should be flushed now.
    ///
    /// Nothing is ever due for an empty warehouse; the timer keeps running
    /// so the first entry after a quiet period flushes on the next tick.
    pub fn should_flush(&self, pending: usize) -> bool {
        if pending == 0 {
            return false;
        }
        if pending >= self.config.max_batch_size {
            return true;
        }
        self.last_flush.elapsed() >= self.config.max_batch_delay
    }

    /// Restart the delay timer.
    pub fn mark_flushed(&mut self) {
        self.last_flush = Instant::now();
    }

    pub fn since_last_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

/// Outcome of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries drained.
    pub total: usize,
    /// Stream groups processed.
    pub groups: usize,
    /// Entries written.
    pub succeeded: usize,
    /// Entries handed to the failure path.
    pub failed: usize,
}

impl FlushReport {
    /// Check if every entry was written.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Fold another group's report into this one.
    pub fn merge(&mut self, other: &FlushReport) {
        self.total += other.total;
        self.groups += other.groups;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_config_default() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.max_batch_delay, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_never_flushes() {
        let trigger = FlushTrigger::new(BatchConfig::testing());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!trigger.should_flush(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_immediately() {
        let trigger = FlushTrigger::new(BatchConfig::testing());
        assert!(!trigger.should_flush(9));
        assert!(trigger.should_flush(10));
        assert!(trigger.should_flush(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_threshold_flushes_small_batches() {
        let mut trigger = FlushTrigger::new(BatchConfig::testing());
        assert!(!trigger.should_flush(1));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(trigger.should_flush(1));

        trigger.mark_flushed();
        assert!(!trigger.should_flush(1));
        assert_eq!(trigger.since_last_flush(), Duration::ZERO);
    }

    #[test]
    fn test_flush_report_merge() {
        let mut report = FlushReport::default();
        assert!(report.is_success());

        report.merge(&FlushReport { total: 3, groups: 1, succeeded: 3, failed: 0 });
        report.merge(&FlushReport { total: 2, groups: 1, succeeded: 1, failed: 1 });

        assert_eq!(report, FlushReport { total: 5, groups: 2, succeeded: 4, failed: 1 });
        assert!(!report.is_success());
    }
}
