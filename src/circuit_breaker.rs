// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker in front of the bulk store.
//!
//! While the store is down, each chunk would otherwise sit out a full request
//! timeout before failing. With the circuit open the call is refused at once
//! as [`PipelineError::CircuitOpen`], and the chunk goes to the failed-document
//! journal without touching the network.
//!
//! ```text
//!   Closed ──(failure rate over window ≥ threshold)──► Open
//!     ▲                                                  │
//!     │                                          (recovery timeout)
//!     │                                                  ▼
//!     └──────────────(probes succeed)─────────────── HalfOpen
//! ```

use crate::error::{PipelineError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Trip and recovery thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Share of failed calls (0.0 to 1.0) in the closed window that opens the circuit.
    pub failure_rate: f32,
    /// Calls remembered while closed.
    pub window: usize,
    /// Trial calls let through while half-open.
    pub half_open_probes: usize,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            window: 10,
            half_open_probes: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-circuit call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

pub struct CircuitBreaker {
    name: String,
    recloser: AsyncRecloser,
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_probes.max(1))
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            recloser: recloser.into(),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` unless the circuit is open.
    ///
    /// Any `Err` from `f` counts against the circuit.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        match self.recloser.call(f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_rejection(&self.name);
                warn!(circuit = %self.name, "Circuit open, call refused");
                Err(PipelineError::CircuitOpen(self.name.clone()))
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, error = %e, "Circuit call failed");
                Err(e)
            }
        }
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}
