//! Central sink writer: publishes events to the topic exchange.
//!
//! Events route by `project.{stream key}.{general|specific}`. A publish
//! that exhausts its retries fails the item, and the owning sink hands it
//! to the failed-log warehouse for the journal.

use super::SinkWriter;
use crate::broker::{BoxFuture, ExchangeKind, ExchangeSpec};
use crate::config::CentralSinkConfig;
use crate::error::Result;
use crate::event::LogEvent;
use crate::publish::{PublishRequest, PublishService};

/// `project.{key}.{specific|general}`, with the key lower-cased.
pub fn routing_key(stream_key: &str, specific: bool) -> String {
    let suffix = if specific { "specific" } else { "general" };
    format!("project.{}.{}", stream_key.to_lowercase(), suffix)
}

/// The durable topic exchange central logs are published to.
pub fn central_exchange(name: &str) -> ExchangeSpec {
    ExchangeSpec::new(name, ExchangeKind::Topic)
}

pub struct CentralWriter {
    publisher: PublishService,
    exchange: ExchangeSpec,
    specific: bool,
    try_count: u32,
    compress: bool,
}

impl CentralWriter {
    pub fn new(publisher: PublishService, config: &CentralSinkConfig) -> Self {
        Self {
            publisher,
            exchange: central_exchange(&config.exchange),
            specific: config.specific,
            try_count: config.try_count,
            compress: config.compress,
        }
    }

    pub fn request<'e>(&self, event: &'e LogEvent) -> PublishRequest<&'e LogEvent> {
        PublishRequest::new(self.exchange.clone(), routing_key(&event.log_key, self.specific), event)
            .compressed(self.compress)
            .with_try_count(self.try_count)
    }

    /// Publish one event; returns the attempts used.
    pub async fn publish(&self, event: &LogEvent) -> Result<u32> {
        self.publisher.publish(&self.request(event)).await
    }
}

impl SinkWriter<LogEvent> for CentralWriter {
    fn process<'a>(&'a self, item: &'a LogEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.publish(item).await.map(|_| ()) })
    }
}

impl std::fmt::Debug for CentralWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralWriter")
            .field("exchange", &self.exchange.name)
            .field("specific", &self.specific)
            .field("try_count", &self.try_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{BrokerConnector, QueueSpec};
    use crate::codec;
    use crate::connection::ConnectionManager;
    use crate::event::Level;
    use crate::pool::ChannelPool;
    use crate::resilience::RetryConfig;
    use crate::sink::{BoundedSink, SinkTarget};
    use crate::warehouse::Warehouse;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    #[test]
    fn test_routing_key() {
        assert_eq!(routing_key("Billing", false), "project.billing.general");
        assert_eq!(routing_key("Billing", true), "project.billing.specific");
    }

    async fn setup(broker: &MemoryBroker) -> (CentralWriter, watch::Sender<bool>) {
        let connection = ConnectionManager::new(Arc::new(broker.clone()), RetryConfig::testing(), RetryConfig::testing());
        let (tx, rx) = watch::channel(false);
        let publisher = PublishService::new(ChannelPool::new(connection, 4), Duration::from_secs(1), rx);
        (CentralWriter::new(publisher, &CentralSinkConfig::for_testing("Billing")), tx)
    }

    async fn bind_queue(broker: &MemoryBroker) {
        let channel = broker.connect().await.unwrap().create_channel().await.unwrap();
        channel.declare_exchange(&central_exchange("central-logs-exchange")).await.unwrap();
        channel.declare_queue(&QueueSpec::new("general")).await.unwrap();
        channel.bind_queue("general", "central-logs-exchange", "project.*.general").await.unwrap();
    }

    #[tokio::test]
    async fn test_publishes_compressed_event() {
        let broker = MemoryBroker::new();
        bind_queue(&broker).await;
        let (writer, _tx) = setup(&broker).await;

        let event = LogEvent::new("Billing", Level::Error, "svc", "boom");
        writer.process(&event).await.unwrap();

        let body = broker.take("general").unwrap();
        let decoded: LogEvent = codec::decode(&body, true).unwrap();
        assert_eq!(decoded, event);
        assert!(broker.take("general").is_none());
    }

    #[tokio::test]
    async fn test_exhausted_publish_falls_back_to_warehouse() {
        let broker = MemoryBroker::new();
        let (writer, _tx) = setup(&broker).await;
        let failed = Arc::new(Warehouse::<LogEvent>::new("failed_logs"));
        broker.fail_next_publishes(10);

        let sink = BoundedSink::builder("central", Arc::new(writer) as Arc<dyn SinkWriter<LogEvent>>)
            .fallback(failed.clone() as Arc<dyn SinkTarget<LogEvent>>)
            .build();
        sink.start().unwrap();
        sink.write(LogEvent::new("Billing", Level::Error, "svc", "lost?"));
        sink.stop(Duration::from_secs(2)).await.unwrap();

        let parked = failed.drain().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].message, "lost?");
    }
}
