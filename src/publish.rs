//! Publish protocol: serialize, compress, declare, publish, retry.
//!
//! # Flow
//!
//! ```text
//! PublishRequest ──encode──▶ body ──┬──▶ attempt 1 ──fail──▶ attempt 2 ... attempt try_count+1
//!                                   │      │
//!                                   │      ├─ lease channel from pool
//!                                   │      ├─ declare exchange (if named)
//!                                   │      ├─ basic.publish + confirm
//!                                   │      └─ release channel (always)
//!                                   ▼
//!                          Ok / last error to caller
//! ```
//!
//! Retries are immediate: there is no backoff between attempts, so the
//! caller-visible latency is the sum of the attempts. Each attempt is bounded
//! by the publish timeout and the whole loop aborts on shutdown.

use crate::broker::{ExchangeSpec, OutgoingMessage, PublishConfirm, ReturnedMessage};
use crate::codec;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::pool::ChannelPool;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Default number of retries after the first attempt.
pub const DEFAULT_TRY_COUNT: u32 = 2;

/// Callback for mandatory publishes the broker could not route.
pub type ReturnHandler = Arc<dyn Fn(&ReturnedMessage) + Send + Sync>;

/// One message to publish.
#[derive(Clone)]
pub struct PublishRequest<T> {
    /// Target exchange; the default (nameless) exchange is never declared.
    pub exchange: ExchangeSpec,
    pub routing_key: String,
    pub payload: T,
    /// Brotli-compress the JSON body.
    pub compress: bool,
    pub priority: u8,
    pub persistent: bool,
    /// Retries after the first attempt.
    pub try_count: u32,
    pub mandatory: bool,
    pub headers: BTreeMap<String, String>,
    pub message_id: Option<String>,
    /// Invoked when a mandatory publish comes back unroutable.
    pub on_return: Option<ReturnHandler>,
}

impl<T> PublishRequest<T> {
    pub fn new(exchange: ExchangeSpec, routing_key: impl Into<String>, payload: T) -> Self {
        Self {
            exchange,
            routing_key: routing_key.into(),
            payload,
            compress: false,
            priority: 0,
            persistent: true,
            try_count: DEFAULT_TRY_COUNT,
            mandatory: false,
            headers: BTreeMap::new(),
            message_id: None,
            on_return: None,
        }
    }

    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_try_count(mut self, try_count: u32) -> Self {
        self.try_count = try_count;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Ask the broker to return the message if nothing is bound for it.
    pub fn mandatory(mut self, on_return: Option<ReturnHandler>) -> Self {
        self.mandatory = true;
        self.on_return = on_return;
        self
    }

    /// Total attempts this request allows.
    pub fn max_attempts(&self) -> u32 {
        self.try_count.saturating_add(1)
    }
}

impl<T> std::fmt::Debug for PublishRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishRequest")
            .field("exchange", &self.exchange.name)
            .field("routing_key", &self.routing_key)
            .field("compress", &self.compress)
            .field("try_count", &self.try_count)
            .field("mandatory", &self.mandatory)
            .finish()
    }
}

/// Publishes typed payloads over pooled channels.
#[derive(Clone)]
pub struct PublishService {
    pool: ChannelPool,
    attempt_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl PublishService {
    pub fn new(pool: ChannelPool, attempt_timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            attempt_timeout,
            shutdown,
        }
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Publish with up to `try_count + 1` attempts.
    ///
    /// Returns the number of attempts used. Serialization errors are not
    /// retried (the body would fail the same way every time), nor are
    /// unroutable mandatory publishes.
    #[instrument(skip(self, request), fields(exchange = %request.exchange.name, routing_key = %request.routing_key))]
    pub async fn publish<T: Serialize>(&self, request: &PublishRequest<T>) -> Result<u32> {
        let started = Instant::now();
        let body = codec::encode(&request.payload, request.compress)?;
        let max_attempts = request.max_attempts();
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                metrics::record_publish(&request.exchange.name, "shutdown", attempt, started.elapsed());
                return Err(PipelineError::Shutdown);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = crate::resilience::shutdown_signal(&mut shutdown) => Err(PipelineError::Shutdown),
                outcome = timeout(self.attempt_timeout, self.attempt(request, body.clone())) => {
                    outcome.unwrap_or(Err(PipelineError::Timeout(self.attempt_timeout)))
                }
            };

            match result {
                Ok(()) => {
                    debug!(attempt, "Published");
                    metrics::record_publish(&request.exchange.name, "success", attempt, started.elapsed());
                    return Ok(attempt);
                }
                Err(PipelineError::Shutdown) => {
                    metrics::record_publish(&request.exchange.name, "shutdown", attempt, started.elapsed());
                    return Err(PipelineError::Shutdown);
                }
                Err(e @ PipelineError::Unroutable { .. }) => {
                    metrics::record_publish(&request.exchange.name, "unroutable", attempt, started.elapsed());
                    return Err(e);
                }
                Err(e) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "Publish failed, retrying");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Publish failed, retry budget exhausted");
                    metrics::record_publish(&request.exchange.name, "failed", attempt, started.elapsed());
                    return Err(e);
                }
            }
        }
    }

    async fn attempt<T>(&self, request: &PublishRequest<T>, body: Vec<u8>) -> Result<()> {
        let channel = self.pool.get_channel().await?;

        let outcome = async {
            if !request.exchange.is_default() {
                channel.declare_exchange(&request.exchange).await?;
            }

            let message = OutgoingMessage {
                exchange: request.exchange.name.clone(),
                routing_key: request.routing_key.clone(),
                body,
                persistent: request.persistent,
                priority: request.priority,
                mandatory: request.mandatory,
                message_id: request.message_id.clone(),
                headers: request.headers.clone(),
            };
            channel.publish(message).await
        }
        .await;

        // Always hand the channel back; the pool drops it if it closed
        channel.release().await;

        match outcome? {
            PublishConfirm::Ack => Ok(()),
            PublishConfirm::Nack => Err(PipelineError::PublishNacked),
            PublishConfirm::Returned(returned) => match &request.on_return {
                Some(handler) => {
                    handler(&returned);
                    Ok(())
                }
                None => Err(PipelineError::Unroutable {
                    exchange: returned.exchange,
                    routing_key: returned.routing_key,
                }),
            },
        }
    }
}

impl std::fmt::Debug for PublishService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishService")
            .field("pool", &self.pool)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}
