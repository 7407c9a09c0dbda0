//! Pipeline state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (tasks spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!
//! Starting ──(sink refused to start)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `LogPipeline::new()`. Everything is built but inert.
//! - **Starting**: `start()` called, background tasks being spawned.
//! - **Running**: Sinks accept events, consumers and workers are live.
//! - **ShuttingDown**: `shutdown()` called. Sinks drain, warehouses flush.
//! - **Stopped**: Broker connection closed. Safe to drop.
//! - **Failed**: Start aborted. Check logs for the cause.

/// State of the log pipeline.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built but not started.
    ///
    /// Call [`start()`](super::LogPipeline::start) to spawn background tasks.
    Created,

    /// Spawning sink workers, consumers and journal workers.
    Starting,

    /// Shipping logs.
    Running,

    /// Draining sinks and flushing warehouses.
    ///
    /// Transitions to `Stopped` once the broker connection is closed.
    ShuttingDown,

    /// Stopped cleanly.
    Stopped,

    /// Start failed. The pipeline cannot be restarted.
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue depth of one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkHealth {
    pub name: String,
    pub queued: usize,
    pub capacity: usize,
    pub running: bool,
}

/// Point-in-time health snapshot, cheap to collect (no I/O).
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with an open broker connection.
    pub ready: bool,
    pub broker_connected: bool,
    pub sinks: Vec<SinkHealth>,
    /// Received events waiting for the next ingest flush.
    pub ingest_pending: usize,
    /// Publish failures waiting for the journal.
    pub failed_logs_pending: usize,
    /// Bulk failures waiting for the journal.
    pub failed_documents_pending: usize,
    /// Bulk chunks refused by the open store circuit so far.
    pub store_rejections: u64,
    /// Ready and no sink is full.
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }
}
