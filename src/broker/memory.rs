//! In-process topic broker.
//!
//! Implements exchange/queue/binding semantics closely enough to drive the
//! whole pipeline without a RabbitMQ server:
//!
//! - fanout, direct and topic routing, default exchange routes by queue name
//! - mandatory publishes with no matching queue come back as [`PublishConfirm::Returned`]
//! - publishing to an undeclared exchange closes the channel (as AMQP does)
//! - prefetch limits in-flight deliveries per channel
//! - unsettled deliveries are requeued when their handle is dropped
//! - nack without requeue moves the message to the queue's dead-letter list
//!
//! Fault injection (`set_available`, `fail_next_publishes`, `drop_connections`)
//! lets tests simulate outages.

use super::{
    binding_matches, Acker, BoxFuture, BrokerChannel, BrokerConnection, BrokerConnector, Delivery,
    DeliveryStream, ExchangeSpec, OutgoingMessage, PublishConfirm, QueueSpec, ReturnedMessage,
};
use crate::error::{PipelineError, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

const CLOSE_POLL: Duration = Duration::from_millis(25);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct StoredMessage {
    tag: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

/// A queue's state, shared by all channels consuming it.
#[derive(Debug, Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<StoredMessage>>,
    dead_letters: Mutex<Vec<StoredMessage>>,
    notify: Notify,
    acked: AtomicUsize,
    requeued: AtomicUsize,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.ready).push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.ready).pop_front()
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, Arc<MemoryQueue>>,
    bindings: Vec<Binding>,
}

struct BrokerState {
    topology: Mutex<Topology>,
    connections: Mutex<Vec<Arc<ConnectionShared>>>,
    available: AtomicBool,
    connect_attempts: AtomicUsize,
    fail_publishes: AtomicUsize,
    published: AtomicUsize,
    next_tag: AtomicU64,
    next_channel: AtomicU64,
}

struct ConnectionShared {
    closed_tx: watch::Sender<Option<String>>,
}

impl ConnectionShared {
    fn is_open(&self) -> bool {
        self.closed_tx.borrow().is_none()
    }

    fn shut(&self, reason: &str) {
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topology: Mutex::new(Topology::default()),
                connections: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                connect_attempts: AtomicUsize::new(0),
                fail_publishes: AtomicUsize::new(0),
                published: AtomicUsize::new(0),
                next_tag: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fault injection
    // ═══════════════════════════════════════════════════════════════════════

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` publishes with a broker error.
    pub fn fail_next_publishes(&self, n: usize) {
        self.state.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Close every open connection, as if the broker restarted.
    pub fn drop_connections(&self, reason: &str) {
        let connections = std::mem::take(&mut *lock(&self.state.connections));
        for connection in connections {
            connection.shut(reason);
        }
    }

    /// Place a raw body on a queue, bypassing exchanges.
    pub fn inject(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        let target = lock(&self.state.topology)
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| PipelineError::broker("inject", format!("no queue '{}'", queue)))?;
        target.push_back(StoredMessage {
            tag: self.state.next_tag.fetch_add(1, Ordering::Relaxed),
            exchange: String::new(),
            routing_key: queue.to_string(),
            body,
            headers: BTreeMap::new(),
            redelivered: false,
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state.connections).iter().filter(|c| c.is_open()).count()
    }

    /// Messages accepted by an exchange (routed or not).
    pub fn published_count(&self) -> usize {
        self.state.published.load(Ordering::SeqCst)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state.topology).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state.topology).queues.contains_key(name)
    }

    /// Whether `queue` is bound to `exchange`, under any key.
    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        lock(&self.state.topology)
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange)
    }

    /// Messages ready for delivery (not in flight).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queue(queue).map(|q| lock(&q.ready).len()).unwrap_or(0)
    }

    pub fn acked(&self, queue: &str) -> usize {
        self.queue(queue).map(|q| q.acked.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn requeued(&self, queue: &str) -> usize {
        self.queue(queue).map(|q| q.requeued.load(Ordering::SeqCst)).unwrap_or(0)
    }

    /// Bodies negatively acknowledged without requeue.
    pub fn dead_lettered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue)
            .map(|q| lock(&q.dead_letters).iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Pop a ready message body (like `basic.get` with auto-ack).
    pub fn take(&self, queue: &str) -> Option<Vec<u8>> {
        let q = self.queue(queue)?;
        let message = q.pop()?;
        q.acked.fetch_add(1, Ordering::SeqCst);
        Some(message.body)
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.state.topology).queues.get(name).cloned()
    }
}

impl BrokerConnector for MemoryBroker {
    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }

    fn connect(&self) -> BoxFuture<'_, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if !self.state.available.load(Ordering::SeqCst) {
                return Err(PipelineError::broker("connect", "connection refused"));
            }

            let (closed_tx, _) = watch::channel(None);
            let shared = Arc::new(ConnectionShared { closed_tx });
            lock(&self.state.connections).push(shared.clone());

            let connection: Arc<dyn BrokerConnection> = Arc::new(MemoryConnection {
                state: self.state.clone(),
                shared,
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    shared: Arc<ConnectionShared>,
}

impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    fn create_channel(&self) -> BoxFuture<'_, Box<dyn BrokerChannel>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(PipelineError::broker("channel.open", "connection is closed"));
            }
            let channel: Box<dyn BrokerChannel> = Box::new(MemoryChannel {
                id: self.state.next_channel.fetch_add(1, Ordering::Relaxed),
                state: self.state.clone(),
                connection: self.shared.clone(),
                open: Arc::new(AtomicBool::new(true)),
                prefetch: Mutex::new(None),
            });
            Ok(channel)
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>> {
        let mut rx = self.shared.closed_tx.subscribe();
        Box::pin(async move {
            match rx.wait_for(|reason| reason.is_some()).await {
                Ok(reason) => reason.clone().unwrap_or_default(),
                Err(_) => "connection dropped".to_string(),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.shut("closed by application");
            Ok(())
        })
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
    connection: Arc<ConnectionShared>,
    open: Arc<AtomicBool>,
    prefetch: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PipelineError::ChannelClosed)
        }
    }

    /// Protocol errors close the channel, like a real broker.
    fn channel_error(&self, operation: &str, message: String) -> PipelineError {
        self.open.store(false, Ordering::SeqCst);
        PipelineError::broker(operation, message)
    }
}

impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.is_open()
    }

    fn declare_exchange<'a>(&'a self, spec: &'a ExchangeSpec) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if spec.is_default() {
                return Ok(());
            }
            let inequivalent = {
                let mut topology = lock(&self.state.topology);
                match topology.exchanges.get(&spec.name) {
                    Some(existing) => existing.kind != spec.kind || existing.durable != spec.durable,
                    None => {
                        topology.exchanges.insert(spec.name.clone(), spec.clone());
                        false
                    }
                }
            };
            if inequivalent {
                return Err(self.channel_error(
                    "exchange.declare",
                    format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", spec.name),
                ));
            }
            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            lock(&self.state.topology)
                .queues
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(MemoryQueue::default()));
            Ok(())
        })
    }

    fn bind_queue<'a>(&'a self, queue: &'a str, exchange: &'a str, routing_key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut topology = lock(&self.state.topology);
            if !topology.exchanges.contains_key(exchange) || !topology.queues.contains_key(queue) {
                drop(topology);
                return Err(self.channel_error(
                    "queue.bind",
                    format!("NOT_FOUND - cannot bind '{}' to '{}'", queue, exchange),
                ));
            }
            let exists = topology
                .bindings
                .iter()
                .any(|b| b.exchange == exchange && b.queue == queue && b.routing_key == routing_key);
            if !exists {
                topology.bindings.push(Binding {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            Ok(())
        })
    }

    fn set_prefetch(&self, count: u16) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            *lock(&self.prefetch) = if count == 0 {
                None
            } else {
                Some(Arc::new(Semaphore::new(count as usize)))
            };
            Ok(())
        })
    }

    fn publish(&self, message: OutgoingMessage) -> BoxFuture<'_, PublishConfirm> {
        Box::pin(async move {
            self.ensure_open()?;

            let injected = self
                .state
                .fail_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(PipelineError::broker("basic.publish", "injected publish failure"));
            }

            let targets: Vec<Arc<MemoryQueue>> = {
                let topology = lock(&self.state.topology);
                if message.exchange.is_empty() {
                    topology.queues.get(&message.routing_key).cloned().into_iter().collect()
                } else {
                    let Some(exchange) = topology.exchanges.get(&message.exchange) else {
                        drop(topology);
                        return Err(self.channel_error(
                            "basic.publish",
                            format!("NOT_FOUND - no exchange '{}'", message.exchange),
                        ));
                    };
                    let mut names: Vec<&str> = topology
                        .bindings
                        .iter()
                        .filter(|b| b.exchange == message.exchange)
                        .filter(|b| binding_matches(exchange.kind, &b.routing_key, &message.routing_key))
                        .map(|b| b.queue.as_str())
                        .collect();
                    names.sort_unstable();
                    names.dedup();
                    names
                        .into_iter()
                        .filter_map(|name| topology.queues.get(name).cloned())
                        .collect()
                }
            };

            self.state.published.fetch_add(1, Ordering::SeqCst);

            if targets.is_empty() {
                if message.mandatory {
                    return Ok(PublishConfirm::Returned(ReturnedMessage {
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        reply_code: 312,
                        reply_text: "NO_ROUTE".to_string(),
                        body: message.body,
                    }));
                }
                debug!(exchange = %message.exchange, routing_key = %message.routing_key, "Message dropped, no binding");
                return Ok(PublishConfirm::Ack);
            }

            for queue in targets {
                queue.push_back(StoredMessage {
                    tag: self.state.next_tag.fetch_add(1, Ordering::Relaxed),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                    redelivered: false,
                });
            }
            Ok(PublishConfirm::Ack)
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, _consumer_tag: &'a str) -> BoxFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            let Some(target) = lock(&self.state.topology).queues.get(queue).cloned() else {
                return Err(self.channel_error("basic.consume", format!("NOT_FOUND - no queue '{}'", queue)));
            };

            let cursor = ConsumeCursor {
                queue: target,
                channel_open: self.open.clone(),
                connection: self.connection.clone(),
                prefetch: lock(&self.prefetch).clone(),
            };

            let stream = futures::stream::unfold(cursor, |cursor| async move {
                let delivery = cursor.next().await?;
                Some((Ok(delivery), cursor))
            });
            let stream: DeliveryStream = Box::pin(stream);
            Ok(stream)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct ConsumeCursor {
    queue: Arc<MemoryQueue>,
    channel_open: Arc<AtomicBool>,
    connection: Arc<ConnectionShared>,
    prefetch: Option<Arc<Semaphore>>,
}

impl ConsumeCursor {
    fn is_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst) && self.connection.is_open()
    }

    /// Next delivery, or `None` once the channel or connection closes.
    async fn next(&self) -> Option<Delivery> {
        let permit = match &self.prefetch {
            Some(semaphore) => loop {
                if !self.is_open() {
                    return None;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => break Some(permit.ok()?),
                    _ = tokio::time::sleep(CLOSE_POLL) => {}
                }
            },
            None => None,
        };

        loop {
            let notified = self.queue.notify.notified();
            if !self.is_open() {
                return None;
            }
            if let Some(message) = self.queue.pop() {
                let acker = MemoryAcker {
                    queue: self.queue.clone(),
                    message: Mutex::new(Some(message.clone())),
                    permit: Mutex::new(permit),
                };
                let mut delivery = Delivery::new(
                    message.tag,
                    message.exchange,
                    message.routing_key,
                    message.body,
                    Box::new(acker),
                );
                delivery.redelivered = message.redelivered;
                delivery.headers = message.headers;
                return Some(delivery);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(CLOSE_POLL) => {}
            }
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    /// `None` once settled.
    message: Mutex<Option<StoredMessage>>,
    /// Prefetch slot, freed on settle like `basic.qos`, not when the delivery is dropped.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn settle(&self, operation: &str) -> Result<StoredMessage> {
        let message = lock(&self.message)
            .take()
            .ok_or_else(|| PipelineError::broker(operation, "PRECONDITION_FAILED - delivery already settled"))?;
        lock(&self.permit).take();
        Ok(message)
    }
}

impl Acker for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.settle("basic.ack")?;
            self.queue.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn nack(&self, requeue: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut message = self.settle("basic.nack")?;
            if requeue {
                message.redelivered = true;
                self.queue.requeued.fetch_add(1, Ordering::SeqCst);
                self.queue.push_front(message);
            } else {
                lock(&self.queue.dead_letters).push(message);
            }
            Ok(())
        })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // Unsettled deliveries go back to the queue
        if let Some(mut message) = lock(&self.message).take() {
            message.redelivered = true;
            self.queue.requeued.fetch_add(1, Ordering::SeqCst);
            self.queue.push_front(message);
        }
    }
}
