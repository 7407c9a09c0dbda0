//! Backoff, throttling and concurrency limits shared by the workers.
//!
//! - [`RetryConfig`]: broker connect and reconnect backoff
//! - [`RateLimiter`]: lines per second during journal replay
//! - [`Bulkhead`]: stream groups ingesting at once
//! - [`shutdown_signal`]: the common wait on the supervisor's stop flag

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Resolves once the shutdown flag turns `true`.
///
/// A dropped sender never resolves it: components built without a
/// supervisor just run until they are dropped.
pub async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Connection Backoff
// =============================================================================

/// Backoff schedule for opening the broker connection.
///
/// The delay after failed attempt `n` is `initial_delay * backoff_factor^(n-1)`,
/// held at `max_delay`. With the broker defaults that is 2s, 4s, 8s, 16s.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts before giving up. `usize::MAX` never gives up.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Bound on a single connect call.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::broker()
    }
}

impl RetryConfig {
    /// Five connect attempts, 2^attempt seconds apart.
    pub fn broker() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(32),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Millisecond delays and three attempts.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Same curve, no attempt limit.
    pub fn unbounded(self) -> Self {
        Self {
            max_attempts: usize::MAX,
            ..self
        }
    }

    /// Whether failed attempt `attempt` (1-based) may be followed by another.
    pub fn allows_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }
}

// =============================================================================
// Replay Throttling
// =============================================================================

/// Token bucket sizing: `refill_rate` tokens per second, at most `burst_size` saved up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl RateLimitConfig {
    /// `per_second` sustained, with a tenth of that as burst.
    pub fn per_second(per_second: u32) -> Self {
        Self {
            burst_size: (per_second / 10).max(1),
            refill_rate: per_second.max(1),
        }
    }
}

/// Paces replayed lines so a large backlog does not flood the broker or store.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: GovLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            config,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.config.refill_rate)
            .field("burst", &self.config.burst_size)
            .finish()
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// Caps how many stream groups write to the store at the same time.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    /// At least one slot.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a slot; the slot is held until the permit drops.
    ///
    /// `None` only if the semaphore was closed, which this type never does.
    pub async fn enter(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_backoff_doubles_from_two_seconds() {
        let retry = RetryConfig::broker();
        let delays: Vec<u64> = (1..=4).map(|n| retry.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
        assert!(retry.allows_retry(4));
        assert!(!retry.allows_retry(5));
    }

    #[test]
    fn test_unbounded_holds_at_ceiling() {
        let retry = RetryConfig::broker().unbounded();
        assert!(retry.allows_retry(10_000_000));
        assert_eq!(retry.delay_for_attempt(6), Duration::from_secs(32));
        assert_eq!(retry.delay_for_attempt(usize::MAX), retry.max_delay);
    }

    #[test]
    fn test_attempt_zero_uses_initial_delay() {
        let retry = RetryConfig::testing();
        assert_eq!(retry.delay_for_attempt(0), retry.initial_delay);
        assert_eq!(retry.delay_for_attempt(1), retry.initial_delay);
    }

    #[test]
    fn test_replay_rate_burst_is_a_tenth() {
        assert_eq!(
            RateLimitConfig::per_second(500),
            RateLimitConfig {
                burst_size: 50,
                refill_rate: 500
            }
        );
        assert_eq!(RateLimitConfig::per_second(0).refill_rate, 1);
        assert_eq!(RateLimitConfig::per_second(3).burst_size, 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_paces_after_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 2,
            refill_rate: 20,
        });
        let started = std::time::Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // Two tokens from the burst, two at 50ms each
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_bulkhead_limits_concurrent_groups() {
        let bulkhead = Bulkhead::new(2);
        let first = bulkhead.enter().await;
        let _second = bulkhead.enter().await;
        assert_eq!(bulkhead.in_use(), 2);

        let waiter = bulkhead.clone();
        let third = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let _permit = waiter.enter().await;
            started.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        assert!(third.await.unwrap() >= Duration::from_millis(40));
    }

    #[test]
    fn test_bulkhead_has_at_least_one_slot() {
        assert_eq!(Bulkhead::new(0).limit(), 1);
    }
}
