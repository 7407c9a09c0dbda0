//! Consume loops: subscribe, dispatch, acknowledge, resubscribe.

use super::{ConsumeDescriptor, ConsumeOutcome, ConsumerRegistry, Dispatch, ErasedConsumer};
use crate::broker::{Delivery, DeliveryStream};
use crate::config::ConsumerSettings;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::pool::{ChannelPool, PooledChannel};
use crate::resilience;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Broker action taken for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Requeue,
    Reject,
}

/// Runs every registered consumer.
pub struct ConsumerHost {
    pool: ChannelPool,
    registry: ConsumerRegistry,
    settings: ConsumerSettings,
}

impl ConsumerHost {
    pub fn new(pool: ChannelPool, registry: ConsumerRegistry, settings: ConsumerSettings) -> Self {
        Self {
            pool,
            registry,
            settings,
        }
    }

    /// Spawn `consumer_count` loops per consumer.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for consumer in self.registry.consumers() {
            let descriptor = consumer.descriptor();
            info!(
                queue = %descriptor.queue.name,
                consumers = descriptor.consumer_count,
                "Starting consumer"
            );
            for worker in 0..descriptor.consumer_count {
                let worker_loop = ConsumeLoop {
                    pool: self.pool.clone(),
                    consumer: consumer.clone(),
                    descriptor: descriptor.clone(),
                    tag: format!("{}-{}", descriptor.queue.name, worker),
                    resubscribe_delay: self.settings.resubscribe_delay_duration(),
                };
                let span = info_span!("consumer", queue = %descriptor.queue.name, worker);
                handles.push(tokio::spawn(worker_loop.run(shutdown.clone()).instrument(span)));
            }
        }
        handles
    }
}

struct ConsumeLoop {
    pool: ChannelPool,
    consumer: Arc<dyn ErasedConsumer>,
    descriptor: ConsumeDescriptor,
    tag: String,
    resubscribe_delay: Duration,
}

impl ConsumeLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.descriptor.queue.name.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.subscribe().await {
                Ok((channel, stream)) => {
                    debug!(queue = %queue, tag = %self.tag, "Subscribed");
                    self.drain_stream(stream, &mut shutdown).await;
                    channel.discard().await;
                }
                Err(e) => warn!(queue = %queue, error = %e, "Subscribe failed"),
            }

            if *shutdown.borrow() {
                break;
            }
            metrics::record_consumer_resubscribe(&queue);
            tokio::select! {
                biased;
                _ = resilience::shutdown_signal(&mut shutdown) => break,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }
        debug!(queue = %queue, tag = %self.tag, "Consume loop stopped");
    }

    /// Declare the topology and open a delivery stream on a fresh channel.
    async fn subscribe(&self) -> Result<(PooledChannel, DeliveryStream)> {
        let channel = self.pool.get_channel().await?;
        let setup = async {
            channel.declare_queue(&self.descriptor.queue).await?;
            if let Some(binding) = &self.descriptor.binding {
                channel.declare_exchange(&binding.exchange).await?;
                channel
                    .bind_queue(&self.descriptor.queue.name, &binding.exchange.name, &binding.routing_key)
                    .await?;
            }
            channel.set_prefetch(self.descriptor.prefetch.max(1)).await?;
            channel.consume(&self.descriptor.queue.name, &self.tag).await
        }
        .await;

        match setup {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                channel.discard().await;
                Err(e)
            }
        }
    }

    async fn drain_stream(&self, mut stream: DeliveryStream, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = resilience::shutdown_signal(shutdown) => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    handle_delivery(self.consumer.as_ref(), &self.descriptor, delivery, shutdown).await;
                }
                Some(Err(e)) => {
                    warn!(queue = %self.descriptor.queue.name, error = %e, "Delivery stream failed");
                    return;
                }
                None => {
                    info!(queue = %self.descriptor.queue.name, "Delivery stream ended");
                    return;
                }
            }
        }
    }
}

/// Process one delivery and settle it. Returns the action taken.
pub async fn handle_delivery(
    consumer: &dyn ErasedConsumer,
    descriptor: &ConsumeDescriptor,
    delivery: Delivery,
    shutdown: &mut watch::Receiver<bool>,
) -> AckAction {
    let queue = descriptor.queue.name.as_str();
    let started = Instant::now();

    let processed = tokio::select! {
        biased;
        _ = resilience::shutdown_signal(shutdown) => Err(PipelineError::Shutdown),
        outcome = tokio::time::timeout(descriptor.timeout, consumer.dispatch(&delivery.body, descriptor.decompress)) => {
            outcome.map_err(|_| PipelineError::Timeout(descriptor.timeout))
        }
    };

    let (action, label) = match processed {
        Ok(Dispatch::Poison(e)) => {
            warn!(queue, delivery_tag = delivery.delivery_tag, error = %e, "Undecodable message dropped");
            (AckAction::Ack, "poison")
        }
        Ok(Dispatch::Handled(Ok(outcome))) => {
            let label = outcome.as_str();
            match outcome {
                ConsumeOutcome::Done => (AckAction::Ack, label),
                ConsumeOutcome::Retry(reason) => {
                    debug!(queue, reason = %reason, "Message requeued");
                    (AckAction::Requeue, label)
                }
                ConsumeOutcome::Delayed(delay, reason) => {
                    debug!(queue, reason = %reason, delay_ms = delay.as_millis() as u64, "Message delayed");
                    tokio::select! {
                        biased;
                        _ = resilience::shutdown_signal(shutdown) => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    (AckAction::Requeue, label)
                }
                ConsumeOutcome::DeadLetter(reason) => {
                    warn!(queue, reason = %reason, "Message dead-lettered");
                    (AckAction::Reject, label)
                }
            }
        }
        Ok(Dispatch::Handled(Err(e))) => {
            warn!(queue, error = %e, "Consumer failed, message rejected");
            (AckAction::Reject, "failed")
        }
        Err(PipelineError::Timeout(timeout)) => {
            warn!(queue, timeout_ms = timeout.as_millis() as u64, "Message processing timed out");
            (AckAction::Reject, "timeout")
        }
        Err(_) => (AckAction::Reject, "cancelled"),
    };

    let settled = match action {
        AckAction::Ack => delivery.ack().await,
        AckAction::Requeue => delivery.nack(true).await,
        AckAction::Reject => delivery.nack(false).await,
    };
    if let Err(e) = settled {
        warn!(queue, delivery_tag = delivery.delivery_tag, error = %e, "Could not settle delivery");
    }

    metrics::record_consume(queue, label, started.elapsed());
    action
}
