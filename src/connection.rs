//! Broker connection management.
//!
//! One physical connection per process, shared by every channel user.
//!
//! # Connection Lifecycle
//!
//! ```text
//! (none) ──connect()──▶ Connecting ──▶ Open ──closed()──▶ Shutdown event
//!                          │  ▲                               │
//!                          │  └────── watcher reconnect ◀─────┘
//!                          ▼          (backoff, forever)
//!                  error after N attempts
//! ```
//!
//! Concurrent callers of [`ConnectionManager::connect()`] converge on a single
//! attempt: the connect path is serialized by a mutex and re-checks the
//! current connection once it holds it.
//!
//! The watcher task (started explicitly with
//! [`ConnectionManager::spawn_watcher()`]) waits for the connection to close,
//! publishes a [`ConnectionEvent::Shutdown`] to every subscriber, and then
//! reconnects with the unbounded retry policy until the pipeline stops.

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector};
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

const EVENT_CAPACITY: usize = 16;

/// Typed notifications about the physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was (re)established.
    Connected { endpoint: String },
    /// The connection shut down; every channel on it is dead.
    Shutdown { reason: String },
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    /// Explicit connects: bounded attempts.
    retry: RetryConfig,
    /// Watcher reconnects: unbounded.
    reconnect: RetryConfig,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connect_lock: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    closing: AtomicBool,
}

/// Owns the broker connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, retry: RetryConfig, reconnect: RetryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                retry,
                reconnect,
                current: RwLock::new(None),
                connect_lock: Mutex::new(()),
                events,
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Endpoint of the underlying connector (no credentials).
    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether an open connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .current
            .read()
            .await
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Return the open connection, connecting if needed.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        if let Some(conn) = self.open_connection().await {
            return Ok(conn);
        }
        self.establish(&self.inner.retry, None).await
    }

    /// Open a fresh channel on the current connection.
    pub async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let conn = self.connect().await?;
        let channel = conn.create_channel().await?;
        metrics::record_channel_created();
        Ok(channel)
    }

    /// Close the connection. The watcher will not reconnect afterwards.
    pub async fn close(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::Release);
        let current = self.inner.current.write().await.take();
        metrics::set_connection_open(false);
        match current {
            Some(conn) if conn.is_open() => {
                info!(endpoint = %self.endpoint(), "Closing broker connection");
                conn.close().await
            }
            _ => Ok(()),
        }
    }

    /// Start the task that reacts to connection shutdowns.
    pub fn spawn_watcher(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(
            async move { manager.watch(shutdown).await }.instrument(info_span!("connection_watcher")),
        )
    }

    async fn open_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.inner
            .current
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    // Every connection the watcher has seen gets a `Shutdown` event once it
    // closes, including one that died before the watcher started waiting on it
    // or that another caller already replaced.
    async fn watch(&self, mut shutdown: watch::Receiver<bool>) {
        let mut seen = self.inner.current.read().await.clone();
        loop {
            if let Some(conn) = seen.take() {
                let reason = tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    reason = conn.closed() => reason,
                };
                if *shutdown.borrow() || self.inner.closing.load(Ordering::Acquire) {
                    return;
                }

                warn!(endpoint = %self.endpoint(), reason = %reason, "Broker connection shut down");
                metrics::record_connection_lost(&self.endpoint());
                metrics::set_connection_open(false);
                // No subscribers is fine
                let _ = self.inner.events.send(ConnectionEvent::Shutdown { reason });
            }

            let conn = match self.open_connection().await {
                Some(conn) => conn,
                None => match self.establish(&self.inner.reconnect, Some(shutdown.clone())).await {
                    Ok(conn) => conn,
                    Err(PipelineError::Shutdown) => return,
                    Err(e) => {
                        error!(error = %e, "Reconnect loop gave up");
                        return;
                    }
                },
            };
            seen = Some(conn);
        }
    }

    /// Connect with `retry`, serialized by the connect lock.
    ///
    /// With a shutdown receiver, backoff sleeps abort once it fires.
    async fn establish(
        &self,
        retry: &RetryConfig,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let _guard = self.inner.connect_lock.lock().await;

        // Another caller may have connected while we waited
        if let Some(conn) = self.open_connection().await {
            return Ok(conn);
        }

        let endpoint = self.endpoint();
        let mut attempt = 0usize;

        loop {
            if self.inner.closing.load(Ordering::Acquire) {
                return Err(PipelineError::Shutdown);
            }
            attempt += 1;

            let outcome = match timeout(retry.connection_timeout, self.inner.connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(retry.connection_timeout)),
            };

            match outcome {
                Ok(conn) => {
                    let previous = self.inner.current.write().await.replace(conn.clone());
                    if let Some(old) = previous {
                        if old.is_open() {
                            let _ = old.close().await;
                        }
                    }

                    metrics::record_connection_attempt(&endpoint, true);
                    metrics::set_connection_open(true);
                    if attempt > 1 {
                        info!(endpoint = %endpoint, attempt, "Connected to broker after retry");
                    } else {
                        info!(endpoint = %endpoint, "Connected to broker");
                    }
                    let _ = self.inner.events.send(ConnectionEvent::Connected { endpoint });
                    return Ok(conn);
                }
                Err(e) => {
                    metrics::record_connection_attempt(&endpoint, false);

                    if !retry.allows_retry(attempt) {
                        error!(endpoint = %endpoint, attempt, error = %e, "Failed to connect after max retries");
                        return Err(PipelineError::broker(
                            "connect",
                            format!("connection failed after {} attempts: {}", attempt, e),
                        ));
                    }

                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );

                    match shutdown.as_mut() {
                        Some(rx) => {
                            tokio::select! {
                                biased;
                                _ = rx.changed() => return Err(PipelineError::Shutdown),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint())
            .field("max_attempts", &self.inner.retry.max_attempts)
            .finish()
    }
}
