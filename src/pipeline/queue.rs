//! Bounded FIFO of delivery items shared by ingestion and the worker pool.
//!
//! Capacity counts queued items plus items claimed by a worker. A claimed
//! item keeps its slot until the worker drops the `Claimed` guard (ack) or
//! calls `requeue()`, which is therefore always able to put it back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::QueueError;
use crate::rules::ForwardingRule;
use crate::transport::InboundMessage;

/// One message bound for one rule's destination.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    /// Correlation id for logs.
    pub id: Uuid,
    pub message: Arc<InboundMessage>,
    pub rule: ForwardingRule,
    pub enqueued_at: DateTime<Utc>,
    /// Send attempts already spent; survives requeues.
    pub attempts: u32,
    /// Transport calls of a multi-part message already delivered. A retry
    /// resumes after them.
    pub sent_parts: usize,
}

impl DeliveryItem {
    pub fn new(message: Arc<InboundMessage>, rule: ForwardingRule) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            rule,
            enqueued_at: Utc::now(),
            attempts: 0,
            sent_parts: 0,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<DeliveryItem>,
    claimed: usize,
    closed: bool,
}

impl QueueState {
    fn occupancy(&self) -> usize {
        self.items.len() + self.claimed
    }
}

/// Fixed-capacity delivery queue.
#[derive(Debug)]
pub struct ForwardQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    /// Wakes workers waiting in `pop_timeout`.
    available: Notify,
    /// Wakes `wait_drained` callers.
    drained: Notify,
}

impl ForwardQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items waiting to be claimed.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().claimed
    }

    /// Enqueue without waiting. Fails when the queue is at capacity.
    pub fn try_push(&self, item: DeliveryItem) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.occupancy() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    fn try_claim(&self) -> Option<DeliveryItem> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        state.claimed += 1;
        Some(item)
    }

    /// Claim the next item, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout or once the queue is closed and empty.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Claimed<'_>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_claim() {
                return Some(Claimed {
                    queue: self,
                    item,
                    released: false,
                });
            }
            if self.lock().closed {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Wait until nothing is queued or claimed. Returns `false` on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().occupancy() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().occupancy() == 0;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Reject further pushes and wake idle workers.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Release spare allocation held by the backing buffer.
    pub fn shrink(&self) {
        self.lock().items.shrink_to_fit();
    }

    fn release(&self, requeue: Option<DeliveryItem>) {
        let empty = {
            let mut state = self.lock();
            state.claimed = state.claimed.saturating_sub(1);
            if let Some(item) = requeue {
                state.items.push_back(item);
            }
            state.occupancy() == 0
        };
        if empty {
            self.drained.notify_waiters();
        } else {
            self.available.notify_one();
        }
    }
}

/// A delivery item claimed by a worker. Dropping it acks the item.
#[derive(Debug)]
pub struct Claimed<'a> {
    queue: &'a ForwardQueue,
    item: DeliveryItem,
    released: bool,
}

impl Claimed<'_> {
    pub fn item(&self) -> &DeliveryItem {
        &self.item
    }

    pub fn item_mut(&mut self) -> &mut DeliveryItem {
        &mut self.item
    }

    /// Put the item back at the tail of the queue.
    pub fn requeue(mut self) {
        self.released = true;
        self.queue.release(Some(self.item.clone()));
    }
}

impl Drop for Claimed<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.queue.release(None);
        }
    }
}
