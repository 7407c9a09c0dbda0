//! Consumes central log events into the ingest warehouse.

use super::{ConsumeDescriptor, ConsumeOutcome, Consumer};
use crate::broker::BoxFuture;
use crate::event::LogEvent;
use crate::sink::central::{central_exchange, routing_key};
use crate::warehouse::Warehouse;
use std::sync::Arc;

pub const GENERAL_QUEUE: &str = "general-log-entry";
pub const GENERAL_ROUTING: &str = "project.*.general";
const GENERAL_CONSUMERS: usize = 20;

pub struct LogEntryConsumer {
    descriptor: ConsumeDescriptor,
    warehouse: Arc<Warehouse<LogEvent>>,
}

impl LogEntryConsumer {
    /// Every stream's general traffic, 20 parallel loops.
    pub fn general(warehouse: Arc<Warehouse<LogEvent>>, exchange: &str) -> Self {
        let descriptor = ConsumeDescriptor::new(GENERAL_QUEUE)
            .bind(central_exchange(exchange), GENERAL_ROUTING)
            .decompressed(true)
            .with_consumers(GENERAL_CONSUMERS);
        Self { descriptor, warehouse }
    }

    /// One stream's specific traffic.
    pub fn specific(warehouse: Arc<Warehouse<LogEvent>>, exchange: &str, stream_key: &str) -> Self {
        let descriptor = ConsumeDescriptor::new(format!("{}-log-entry", stream_key))
            .bind(central_exchange(exchange), routing_key(stream_key, true))
            .decompressed(true);
        Self { descriptor, warehouse }
    }
}

impl Consumer for LogEntryConsumer {
    type Message = LogEvent;

    fn descriptor(&self) -> ConsumeDescriptor {
        self.descriptor.clone()
    }

    fn consume(&self, message: LogEvent) -> BoxFuture<'_, ConsumeOutcome> {
        Box::pin(async move {
            self.warehouse.push_with_backpressure(message).await;
            Ok(ConsumeOutcome::Done)
        })
    }
}

impl std::fmt::Debug for LogEntryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntryConsumer")
            .field("queue", &self.descriptor.queue.name)
            .field("warehouse", &self.warehouse.name())
            .finish()
    }
}
