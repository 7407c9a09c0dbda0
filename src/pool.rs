//! Channel pool over the shared broker connection.
//!
//! Channels are cheap compared to connections but still cost a round trip
//! to open, so publishers borrow them from a lock-free idle queue instead.
//!
//! # Invariants
//!
//! - A channel is owned by at most one borrower ([`PooledChannel`] is not `Clone`)
//! - A closed channel never enters the idle queue
//! - The idle queue never holds more than `max_size` channels
//!
//! When the connection shuts down every idle channel is dead, so the purge
//! listener empties the queue on [`ConnectionEvent::Shutdown`].

use crate::broker::BrokerChannel;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::Result;
use crate::metrics;
use crossbeam_queue::SegQueue;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

struct PoolInner {
    connection: ConnectionManager,
    idle: SegQueue<Box<dyn BrokerChannel>>,
    idle_count: AtomicUsize,
    max_size: usize,
    purge_lock: Mutex<()>,
}

impl PoolInner {
    /// Reserve an idle slot, or `false` when the pool is full.
    fn reserve_slot(&self) -> bool {
        self.idle_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.max_size {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn pop(&self) -> Option<Box<dyn BrokerChannel>> {
        let channel = self.idle.pop()?;
        self.idle_count.fetch_sub(1, Ordering::AcqRel);
        Some(channel)
    }

    /// Push an open channel back if there is room. Returns it otherwise.
    fn offer(&self, channel: Box<dyn BrokerChannel>) -> std::result::Result<(), Box<dyn BrokerChannel>> {
        if !channel.is_open() || !self.reserve_slot() {
            return Err(channel);
        }
        self.idle.push(channel);
        metrics::set_pool_idle(self.idle_count.load(Ordering::Acquire));
        Ok(())
    }
}

/// Pool of idle broker channels. Cheap to clone.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    pub fn new(connection: ConnectionManager, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connection,
                idle: SegQueue::new(),
                idle_count: AtomicUsize::new(0),
                max_size: max_size.max(1),
                purge_lock: Mutex::new(()),
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Idle channels currently pooled.
    pub fn idle(&self) -> usize {
        self.inner.idle_count.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Lease an open channel: an idle one if available, else a new one.
    pub async fn get_channel(&self) -> Result<PooledChannel> {
        while let Some(channel) = self.inner.pop() {
            if channel.is_open() {
                return Ok(PooledChannel::new(channel, self.inner.clone()));
            }
            debug!(channel_id = channel.id(), "Discarding closed pooled channel");
            let _ = channel.close().await;
        }

        let channel = self.inner.connection.create_channel().await?;
        Ok(PooledChannel::new(channel, self.inner.clone()))
    }

    /// Give a channel back. Closed channels and overflow are closed and dropped.
    pub async fn return_channel(&self, channel: Box<dyn BrokerChannel>) {
        if let Err(channel) = self.inner.offer(channel) {
            if channel.is_open() {
                debug!(channel_id = channel.id(), max_size = self.inner.max_size, "Pool full, closing channel");
            }
            let _ = channel.close().await;
        }
    }

    /// Close and discard every idle channel. Returns how many were dropped.
    pub async fn purge(&self) -> usize {
        let _guard = self.inner.purge_lock.lock().await;
        let mut purged = 0;
        while let Some(channel) = self.inner.pop() {
            let _ = channel.close().await;
            purged += 1;
        }
        metrics::record_channels_purged(purged);
        metrics::set_pool_idle(self.idle());
        purged
    }

    /// Purge the pool whenever the connection shuts down.
    pub fn spawn_purge_listener(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.clone();
        let mut events = self.inner.connection.subscribe();
        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = shutdown.changed() => return,
                        event = events.recv() => event,
                    };
                    match event {
                        Ok(ConnectionEvent::Shutdown { reason }) => {
                            let purged = pool.purge().await;
                            info!(purged, reason = %reason, "Purged channel pool after connection shutdown");
                        }
                        Ok(ConnectionEvent::Connected { .. }) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Connection events lagged, purging pool");
                            pool.purge().await;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
            .instrument(info_span!("pool_purge")),
        )
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("idle", &self.idle())
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

/// An exclusively leased channel.
///
/// Call [`release()`](Self::release) when done. Dropping the lease also puts
/// an open channel back, but cannot close one that does not fit.
pub struct PooledChannel {
    channel: Option<Box<dyn BrokerChannel>>,
    pool: Arc<PoolInner>,
}

impl PooledChannel {
    fn new(channel: Box<dyn BrokerChannel>, pool: Arc<PoolInner>) -> Self {
        Self {
            channel: Some(channel),
            pool,
        }
    }

    /// Return the channel to the pool.
    pub async fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(channel) = self.pool.offer(channel) {
                let _ = channel.close().await;
            }
        }
    }

    /// Close the channel instead of returning it.
    pub async fn discard(mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
    }
}

impl Deref for PooledChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        // Only `release`/`discard`/`drop` take the channel, and they consume the lease
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("pooled channel used after release"),
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(channel) = self.pool.offer(channel) {
                debug!(channel_id = channel.id(), "Dropping leased channel without close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::resilience::RetryConfig;
    use std::time::Duration;

    fn pool(broker: &MemoryBroker, max_size: usize) -> ChannelPool {
        let connection = ConnectionManager::new(
            Arc::new(broker.clone()),
            RetryConfig::testing(),
            RetryConfig::testing(),
        );
        ChannelPool::new(connection, max_size)
    }

    #[tokio::test]
    async fn test_released_channel_is_reused() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 4);

        let lease = pool.get_channel().await.unwrap();
        let id = lease.id();
        lease.release().await;
        assert_eq!(pool.idle(), 1);

        let lease = pool.get_channel().await.unwrap();
        assert_eq!(lease.id(), id);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_never_returns_to_pool() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 4);

        let lease = pool.get_channel().await.unwrap();
        lease.close().await.unwrap();
        lease.release().await;

        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_max_size() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 2);

        let mut leases = Vec::new();
        for _ in 0..5 {
            leases.push(pool.get_channel().await.unwrap());
        }
        for lease in leases {
            lease.release().await;
        }

        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn test_closed_idle_channels_are_skipped() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 4);

        let a = pool.get_channel().await.unwrap();
        let stale_id = a.id();
        a.release().await;

        // Connection dies: the idle channel is now closed
        broker.drop_connections("restart");
        let lease = pool.get_channel().await.unwrap();

        assert!(lease.is_open());
        assert_ne!(lease.id(), stale_id);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_drop_returns_open_channel() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 4);

        {
            let _lease = pool.get_channel().await.unwrap();
        }
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_purge_listener_empties_pool_on_shutdown() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let a = pool.get_channel().await.unwrap();
        let b = pool.get_channel().await.unwrap();
        a.release().await;
        b.release().await;
        assert_eq!(pool.idle(), 2);

        let listener = pool.spawn_purge_listener(shutdown_rx.clone());
        let watcher = pool.connection().spawn_watcher(shutdown_rx);
        broker.drop_connections("restart");

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.idle() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
        watcher.await.unwrap();
    }
}
