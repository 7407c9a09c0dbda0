//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Event, pipeline and journal fixtures
//! - Recording sink writers and replay targets
//! - RabbitMQ testcontainer setup
//! - Tracing output for failing tests (`RUST_LOG=log_pipeline=debug`)

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per test binary. Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("log_pipeline=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
