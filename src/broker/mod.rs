//! Broker abstraction: connections, channels, deliveries.
//!
//! The pipeline talks to its message broker only through these traits, in the
//! same shape as an AMQP 0-9-1 client: one physical [`BrokerConnection`]
//! multiplexes many lightweight [`BrokerChannel`]s.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryBroker`]: in-process topic broker with fault injection,
//!   used by tests and single-process deployments
//! - `amqp::AmqpConnector` (feature `amqp`): RabbitMQ via `lapin`
//!
//! # Example
//!
//! ```rust,no_run
//! use log_pipeline::broker::{BrokerConnector, ExchangeKind, ExchangeSpec, OutgoingMessage};
//! use log_pipeline::broker::memory::MemoryBroker;
//!
//! # async fn example() -> log_pipeline::Result<()> {
//! let broker = MemoryBroker::new();
//! let connection = broker.connect().await?;
//! let channel = connection.create_channel().await?;
//! channel.declare_exchange(&ExchangeSpec::new("logs", ExchangeKind::Topic)).await?;
//! channel.publish(OutgoingMessage::new("logs", "project.a.general", b"{}".to_vec())).await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use crate::error::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by broker trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of deliveries from a consumer subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Fanout => write!(f, "fanout"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

fn default_true() -> bool {
    true
}

impl ExchangeSpec {
    /// Durable, non-auto-delete exchange.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }

    /// The nameless default exchange (routes by queue name, never declared).
    pub fn default_exchange() -> Self {
        Self::new("", ExchangeKind::Direct)
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable, shared, non-auto-delete queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Persistent delivery mode (survives broker restart).
    pub persistent: bool,
    pub priority: u8,
    /// Ask the broker to return the message if no queue matches.
    pub mandatory: bool,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            persistent: true,
            priority: 0,
            mandatory: false,
            message_id: None,
            headers: BTreeMap::new(),
        }
    }
}

/// A message handed back by the broker because it was unroutable.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub body: Vec<u8>,
}

/// Broker's verdict on a publish.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishConfirm {
    /// Accepted (and routed, if mandatory).
    Ack,
    /// Mandatory publish matched no queue.
    Returned(ReturnedMessage),
    /// Broker refused the message.
    Nack,
}

/// Settles one delivery.
pub trait Acker: Send + Sync {
    fn ack(&self) -> BoxFuture<'_, ()>;

    /// Negative acknowledge. `requeue = false` discards (or dead-letters) it.
    fn nack(&self, requeue: bool) -> BoxFuture<'_, ()>;
}

/// One consumed message.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            body,
            headers: BTreeMap::new(),
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Opens physical connections.
pub trait BrokerConnector: Send + Sync + 'static {
    /// Human readable endpoint for logs (never includes credentials).
    fn endpoint(&self) -> String;

    fn connect(&self) -> BoxFuture<'_, Arc<dyn BrokerConnection>>;
}

/// One physical broker connection.
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    fn create_channel(&self) -> BoxFuture<'_, Box<dyn BrokerChannel>>;

    /// Resolves once the connection has shut down, with the reason.
    fn closed(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A virtual channel multiplexed over a connection.
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    fn declare_exchange<'a>(&'a self, spec: &'a ExchangeSpec) -> BoxFuture<'a, ()>;

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BoxFuture<'a, ()>;

    fn bind_queue<'a>(&'a self, queue: &'a str, exchange: &'a str, routing_key: &'a str) -> BoxFuture<'a, ()>;

    /// Limit unacknowledged deliveries in flight on this channel.
    fn set_prefetch(&self, count: u16) -> BoxFuture<'_, ()>;

    fn publish(&self, message: OutgoingMessage) -> BoxFuture<'_, PublishConfirm>;

    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str) -> BoxFuture<'a, DeliveryStream>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// AMQP topic match: `*` is exactly one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Does a binding with `binding_key` on an exchange of `kind` route `routing_key`?
pub fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}
