//! Unbounded outbound packet queue with priority insertion.
//!
//! Each stream writer drains one queue. Keepalive traffic jumps the line
//! with [`OutboundQueue::push_front`] so a backlog of bulk data cannot delay
//! liveness probes.

use std::collections::VecDeque;
use std::sync::Mutex;

use protocol::error::{ProtocolError, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer, single-consumer queue.
pub struct OutboundQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> OutboundQueue<T> {
    /// Create an empty open queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<T>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn push(&self, item: T, front: bool) -> Result<()> {
        self.with_inner(|inner| {
            if inner.closed {
                return Err(ProtocolError::ConnectionClosed("outbound queue closed".into()));
            }
            if front {
                inner.items.push_front(item);
            } else {
                inner.items.push_back(item);
            }
            Ok(())
        })?;
        self.notify.notify_one();
        Ok(())
    }

    /// Append an item.
    pub fn push_back(&self, item: T) -> Result<()> {
        self.push(item, false)
    }

    /// Insert an item ahead of everything queued.
    pub fn push_front(&self, item: T) -> Result<()> {
        self.push(item, true)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and drained, or when `cancel`
    /// fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            let next = self.with_inner(|inner| match inner.items.pop_front() {
                Some(item) => Some(Some(item)),
                None if inner.closed => Some(None),
                None => None,
            });
            if let Some(item) = next {
                return item;
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Reject further pushes and wake the consumer.
    pub fn close(&self) {
        self.with_inner(|inner| inner.closed = true);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.with_inner(|inner| inner.closed)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.items.len())
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for OutboundQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
