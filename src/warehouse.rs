//! Unbounded lock-free staging queue.
//!
//! A warehouse sits between producers that must never block (consumers,
//! sink fallbacks) and a periodic worker that drains everything at once.
//! Draining is exclusive: a second concurrent drain gets `None` instead of
//! racing the first.

use crate::metrics;
use crate::sink::SinkTarget;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

pub struct Warehouse<T> {
    name: String,
    queue: SegQueue<T>,
    len: AtomicUsize,
    draining: AtomicBool,
    soft_cap: Option<usize>,
    space: Notify,
}

/// Clears the draining flag when the drain ends, even on panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> Warehouse<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: SegQueue::new(),
            len: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            soft_cap: None,
            space: Notify::new(),
        }
    }

    /// Producers using [`push_with_backpressure`](Self::push_with_backpressure)
    /// wait while the warehouse holds `cap` or more entries.
    pub fn with_soft_cap(mut self, cap: Option<usize>) -> Self {
        self.soft_cap = cap.filter(|c| *c > 0);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // `len` is raised before the item becomes visible to `drain`, so it never
    // counts fewer entries than the queue holds.
    pub fn push(&self, item: T) {
        let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
        self.queue.push(item);
        metrics::set_warehouse_depth(&self.name, len);
    }

    pub fn push_many(&self, items: impl IntoIterator<Item = T>) {
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return;
        }
        let added = items.len();
        let len = self.len.fetch_add(added, Ordering::AcqRel) + added;
        for item in items {
            self.queue.push(item);
        }
        metrics::set_warehouse_depth(&self.name, len);
    }

    /// Push, first waiting for room if a soft cap is set and reached.
    pub async fn push_with_backpressure(&self, item: T) {
        if let Some(cap) = self.soft_cap {
            loop {
                let space = self.space.notified();
                if self.len() < cap {
                    break;
                }
                space.await;
            }
        }
        self.push(item);
    }

    /// Take everything currently queued.
    ///
    /// Returns `None` if another drain is in progress.
    pub fn drain(&self) -> Option<Vec<T>> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        let mut items = Vec::with_capacity(self.len());
        while let Some(item) = self.queue.pop() {
            items.push(item);
        }
        let len = self.len.fetch_sub(items.len(), Ordering::AcqRel).saturating_sub(items.len());
        metrics::set_warehouse_depth(&self.name, len);
        self.space.notify_waiters();
        Some(items)
    }
}

impl<T: Send> SinkTarget<T> for Warehouse<T> {
    fn offer(&self, item: T) -> std::result::Result<(), T> {
        self.push(item);
        Ok(())
    }
}

impl<T> std::fmt::Debug for Warehouse<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warehouse")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("soft_cap", &self.soft_cap)
            .finish()
    }
}
