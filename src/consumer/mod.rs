//! Declarative consumers over broker queues.
//!
//! A [`Consumer`] states *what* it consumes in a [`ConsumeDescriptor`] and
//! implements business logic for one typed message. The
//! [`runtime::ConsumerHost`] turns every registered consumer into
//! `consumer_count` consume loops, each on its own pooled channel, and maps
//! each [`ConsumeOutcome`] to a broker acknowledgment:
//!
//! | Outcome | Broker action |
//! |---|---|
//! | `Done` | ack |
//! | `Retry` | nack, requeue |
//! | `Delayed(d)` | wait `d`, nack, requeue |
//! | `DeadLetter` | nack, no requeue |
//! | undecodable payload | ack and drop |
//! | error, timeout, shutdown | nack, no requeue |
//!
//! Consumers are registered explicitly in a [`ConsumerRegistry`].

pub mod log_entry;
pub mod runtime;

use crate::broker::{BoxFuture, ExchangeSpec, QueueSpec};
use crate::codec;
use crate::error::{PipelineError, Result};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Exchange a queue is bound to, and the binding pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingSpec {
    pub exchange: ExchangeSpec,
    pub routing_key: String,
}

/// Where and how a consumer receives its messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeDescriptor {
    pub queue: QueueSpec,
    /// Declared and bound before consuming, if set.
    pub binding: Option<BindingSpec>,
    /// Per-message processing budget.
    pub timeout: Duration,
    /// Bodies are Brotli-compressed JSON.
    pub decompress: bool,
    /// Parallel consume loops, each on its own channel.
    pub consumer_count: usize,
    pub prefetch: u16,
}

impl ConsumeDescriptor {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: QueueSpec::new(queue),
            binding: None,
            timeout: Duration::from_secs(30),
            decompress: false,
            consumer_count: 1,
            prefetch: 1,
        }
    }

    pub fn bind(mut self, exchange: ExchangeSpec, routing_key: impl Into<String>) -> Self {
        self.binding = Some(BindingSpec {
            exchange,
            routing_key: routing_key.into(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn decompressed(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    pub fn with_consumers(mut self, count: usize) -> Self {
        self.consumer_count = count.max(1);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

/// Business verdict on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Done,
    Retry(String),
    Delayed(Duration, String),
    DeadLetter(String),
}

impl ConsumeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Retry(_) => "retry",
            Self::Delayed(..) => "delayed",
            Self::DeadLetter(_) => "dead_letter",
        }
    }
}

/// A typed consumer.
pub trait Consumer: Send + Sync + 'static {
    type Message: DeserializeOwned + Send + 'static;

    fn descriptor(&self) -> ConsumeDescriptor;

    fn consume(&self, message: Self::Message) -> BoxFuture<'_, ConsumeOutcome>;
}

/// Result of decoding and handling one body.
#[derive(Debug)]
pub enum Dispatch {
    /// The body could not be decoded.
    Poison(PipelineError),
    Handled(Result<ConsumeOutcome>),
}

/// Type-erased consumer, as held by the registry.
pub trait ErasedConsumer: Send + Sync {
    fn descriptor(&self) -> ConsumeDescriptor;

    fn dispatch<'a>(&'a self, body: &'a [u8], decompress: bool) -> Pin<Box<dyn Future<Output = Dispatch> + Send + 'a>>;
}

impl<C: Consumer> ErasedConsumer for C {
    fn descriptor(&self) -> ConsumeDescriptor {
        Consumer::descriptor(self)
    }

    fn dispatch<'a>(&'a self, body: &'a [u8], decompress: bool) -> Pin<Box<dyn Future<Output = Dispatch> + Send + 'a>> {
        Box::pin(async move {
            match codec::decode::<C::Message>(body, decompress) {
                Ok(message) => Dispatch::Handled(self.consume(message).await),
                Err(e) => Dispatch::Poison(e),
            }
        })
    }
}

/// The consumers a host runs.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: Vec<Arc<dyn ErasedConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Consumer>(mut self, consumer: C) -> Self {
        self.consumers.push(Arc::new(consumer));
        self
    }

    pub fn register_arc(mut self, consumer: Arc<dyn ErasedConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn consumers(&self) -> &[Arc<dyn ErasedConsumer>] {
        &self.consumers
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.consumers.iter().map(|c| c.descriptor().queue.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ExchangeKind;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    struct Even;

    impl Consumer for Even {
        type Message = Ping;

        fn descriptor(&self) -> ConsumeDescriptor {
            ConsumeDescriptor::new("pings")
                .bind(ExchangeSpec::new("ping-exchange", ExchangeKind::Topic), "ping.#")
                .with_consumers(3)
        }

        fn consume(&self, message: Ping) -> BoxFuture<'_, ConsumeOutcome> {
            Box::pin(async move {
                if message.n % 2 == 0 {
                    Ok(ConsumeOutcome::Done)
                } else {
                    Ok(ConsumeOutcome::Retry("odd".into()))
                }
            })
        }
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = ConsumeDescriptor::new("q");
        assert_eq!(descriptor.timeout, Duration::from_secs(30));
        assert_eq!(descriptor.prefetch, 1);
        assert_eq!(descriptor.consumer_count, 1);
        assert!(descriptor.queue.durable);
        assert!(descriptor.binding.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_decodes_and_handles() {
        let registry = ConsumerRegistry::new().register(Even);
        let consumer = &registry.consumers()[0];
        assert_eq!(consumer.descriptor().consumer_count, 3);

        let even = serde_json::to_vec(&Ping { n: 2 }).unwrap();
        assert!(matches!(
            consumer.dispatch(&even, false).await,
            Dispatch::Handled(Ok(ConsumeOutcome::Done))
        ));

        let compressed = codec::encode(&Ping { n: 3 }, true).unwrap();
        assert!(matches!(
            consumer.dispatch(&compressed, true).await,
            Dispatch::Handled(Ok(ConsumeOutcome::Retry(_)))
        ));

        assert!(matches!(consumer.dispatch(b"{oops", false).await, Dispatch::Poison(_)));
    }
}
