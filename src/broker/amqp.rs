//! RabbitMQ adapter over `lapin`.
//!
//! Channels are opened in publisher-confirm mode so that a mandatory publish
//! with no matching queue surfaces as [`PublishConfirm::Returned`] instead of
//! vanishing.

use super::{
    Acker, BoxFuture, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutgoingMessage, PublishConfirm, QueueSpec, ReturnedMessage,
};
use crate::config::BrokerConfig;
use crate::error::{PipelineError, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP connections from [`BrokerConfig`].
pub struct AmqpConnector {
    uri: String,
    endpoint: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        let vhost = if config.vhost == "/" {
            "%2f".to_string()
        } else {
            config.vhost.trim_start_matches('/').to_string()
        };
        Self {
            uri: format!(
                "amqp://{}:{}@{}:{}/{}",
                config.user, config.password, config.host, config.port, vhost
            ),
            endpoint: format!("amqp://{}:{}/{}", config.host, config.port, vhost),
            connection_name: config.connection_name.clone(),
        }
    }
}

impl BrokerConnector for AmqpConnector {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn connect(&self) -> BoxFuture<'_, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            let properties =
                ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
            let connection = Connection::connect(&self.uri, properties)
                .await
                .map_err(|e| PipelineError::broker("connect", e))?;

            let (closed_tx, _) = watch::channel(None);
            let closed_tx = Arc::new(closed_tx);
            let on_error_tx = closed_tx.clone();
            connection.on_error(move |err| {
                warn!(error = %err, "AMQP connection error");
                on_error_tx.send_replace(Some(err.to_string()));
            });

            let connection: Arc<dyn BrokerConnection> = Arc::new(AmqpConnection {
                inner: connection,
                closed_tx,
            });
            Ok(connection)
        })
    }
}

struct AmqpConnection {
    inner: Connection,
    closed_tx: Arc<watch::Sender<Option<String>>>,
}

impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected() && self.closed_tx.borrow().is_none()
    }

    fn create_channel(&self) -> BoxFuture<'_, Box<dyn BrokerChannel>> {
        Box::pin(async move {
            let channel = self
                .inner
                .create_channel()
                .await
                .map_err(|e| PipelineError::broker("channel.open", e))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| PipelineError::broker("confirm.select", e))?;
            let channel: Box<dyn BrokerChannel> = Box::new(AmqpChannel { inner: channel });
            Ok(channel)
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>> {
        let mut rx = self.closed_tx.subscribe();
        Box::pin(async move {
            match rx.wait_for(|reason| reason.is_some()).await {
                Ok(reason) => reason.clone().unwrap_or_default(),
                Err(_) => "connection dropped".to_string(),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed_tx.send_replace(Some("closed by application".to_string()));
            self.inner
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| PipelineError::broker("connection.close", e))
        })
    }
}

struct AmqpChannel {
    inner: Channel,
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u64 {
        u64::from(self.inner.id())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn declare_exchange<'a>(&'a self, spec: &'a ExchangeSpec) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if spec.is_default() {
                return Ok(());
            }
            let options = ExchangeDeclareOptions {
                durable: spec.durable,
                auto_delete: spec.auto_delete,
                ..Default::default()
            };
            self.inner
                .exchange_declare(&spec.name, lapin_kind(spec.kind), options, FieldTable::default())
                .await
                .map_err(|e| PipelineError::broker("exchange.declare", e))
        })
    }

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let options = QueueDeclareOptions {
                durable: spec.durable,
                exclusive: spec.exclusive,
                auto_delete: spec.auto_delete,
                ..Default::default()
            };
            self.inner
                .queue_declare(&spec.name, options, FieldTable::default())
                .await
                .map(|_| ())
                .map_err(|e| PipelineError::broker("queue.declare", e))
        })
    }

    fn bind_queue<'a>(&'a self, queue: &'a str, exchange: &'a str, routing_key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner
                .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
                .await
                .map_err(|e| PipelineError::broker("queue.bind", e))
        })
    }

    fn set_prefetch(&self, count: u16) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .basic_qos(count, BasicQosOptions::default())
                .await
                .map_err(|e| PipelineError::broker("basic.qos", e))
        })
    }

    fn publish(&self, message: OutgoingMessage) -> BoxFuture<'_, PublishConfirm> {
        Box::pin(async move {
            let mut properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(if message.persistent { 2 } else { 1 })
                .with_priority(message.priority);
            if let Some(id) = message.message_id {
                properties = properties.with_message_id(id.into());
            }
            if !message.headers.is_empty() {
                let mut table = FieldTable::default();
                for (key, value) in message.headers {
                    table.insert(key.into(), AMQPValue::LongString(value.into()));
                }
                properties = properties.with_headers(table);
            }

            let options = BasicPublishOptions {
                mandatory: message.mandatory,
                ..Default::default()
            };
            let confirmation = self
                .inner
                .basic_publish(&message.exchange, &message.routing_key, options, &message.body, properties)
                .await
                .map_err(|e| PipelineError::broker("basic.publish", e))?
                .await
                .map_err(|e| PipelineError::broker("basic.publish", e))?;

            Ok(match confirmation {
                Confirmation::Ack(Some(returned)) => PublishConfirm::Returned(ReturnedMessage {
                    exchange: returned.delivery.exchange.as_str().to_string(),
                    routing_key: returned.delivery.routing_key.as_str().to_string(),
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_string(),
                    body: returned.delivery.data.clone(),
                }),
                Confirmation::Ack(None) | Confirmation::NotRequested => PublishConfirm::Ack,
                Confirmation::Nack(_) => PublishConfirm::Nack,
            })
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str) -> BoxFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let consumer = self
                .inner
                .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
                .await
                .map_err(|e| PipelineError::broker("basic.consume", e))?;

            let stream = consumer.map(|item| {
                let delivery = item.map_err(|e| PipelineError::broker("basic.deliver", e))?;
                let mut mapped = Delivery::new(
                    delivery.delivery_tag,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.data,
                    Box::new(AmqpAcker(delivery.acker)),
                );
                mapped.redelivered = delivery.redelivered;
                Ok(mapped)
            });
            let stream: DeliveryStream = Box::pin(stream);
            Ok(stream)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.is_open() {
                return Ok(());
            }
            self.inner
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| PipelineError::broker("channel.close", e))
        })
    }
}

struct AmqpAcker(lapin::acker::Acker);

impl Acker for AmqpAcker {
    fn ack(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| PipelineError::broker("basic.ack", e))
        })
    }

    fn nack(&self, requeue: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.0
                .nack(BasicNackOptions {
                    requeue,
                    ..Default::default()
                })
                .await
                .map_err(|e| PipelineError::broker("basic.nack", e))
        })
    }
}
