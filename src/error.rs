// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the log pipeline.
//!
//! Errors are categorized by the collaborator they come from (broker, store,
//! filesystem) and carry enough context to diagnose the failing stage.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Connection drop, channel error, broker unreachable |
//! | `ChannelClosed` | Yes | Leased channel died mid-operation |
//! | `PublishNacked` | Yes | Broker refused the publish confirm |
//! | `Timeout` | Yes | Operation exceeded its deadline |
//! | `Store` | 5xx/429 | Bulk store request failed |
//! | `CircuitOpen` | Yes | Store circuit breaker is rejecting calls |
//! | `Unroutable` | No | Mandatory publish had no matching queue |
//! | `Serialization` | No | Payload could not be encoded/decoded |
//! | `Compression` | No | Brotli stream corrupt |
//! | `Io` | No | Local journal/file failure |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Pipeline state machine violation |
//! | `Shutdown` | No | Pipeline is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The publish loop retries regardless of category (bounded by the request's
//! try count), but [`PipelineError::is_retryable()`] drives the consumer
//! reconnect loop and the store circuit breaker classification.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur anywhere in the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Broker connection, channel or protocol error.
    #[error("Broker error ({operation}): {message}")]
    Broker { operation: String, message: String },

    /// The leased channel was closed underneath the caller.
    #[error("Broker channel closed")]
    ChannelClosed,

    /// A mandatory publish was returned by the broker (no queue bound).
    #[error("Unroutable message: exchange '{exchange}', routing key '{routing_key}'")]
    Unroutable { exchange: String, routing_key: String },

    /// The broker negatively confirmed a publish.
    #[error("Publish not confirmed by broker")]
    PublishNacked,

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Brotli compression or decompression failure.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Filesystem error on a journal or log file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bulk store request failure.
    ///
    /// `status` is the HTTP status when the store answered at all.
    #[error("Store error: {message}")]
    Store { message: String, status: Option<u16> },

    /// Circuit breaker rejected the call without attempting it.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Operation deadline exceeded.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pipeline state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running pipeline).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a broker error from anything displayable.
    pub fn broker(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create an I/O error tagged with the file it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Store {
            message: message.into(),
            status,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::ChannelClosed => true,
            Self::PublishNacked => true,
            Self::Timeout(_) => true,
            Self::CircuitOpen(_) => true,
            Self::Store { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true, // Transport failure, never reached the store
            },
            Self::Unroutable { .. } => false,
            Self::Serialization(_) => false,
            Self::Compression(_) => false,
            Self::Io { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
