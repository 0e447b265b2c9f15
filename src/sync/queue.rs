//! Bounded, ordered replication queue between the watcher and one executor.
//!
//! Backpressure: when a child falls behind, the watcher blocks on enqueue up
//! to a timeout, then evicts the oldest queued event and logs the data loss.
//! Loss is never silent.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::models::ChangeEvent;

struct QueueInner {
    items: VecDeque<ChangeEvent>,
    closed: bool,
    dropped: u64,
}

/// FIFO channel carrying change events to one child executor.
pub struct ReplicationQueue {
    child_account: String,
    capacity: usize,
    inner: Mutex<QueueInner>,
    readable: Notify,
    writable: Notify,
}

impl ReplicationQueue {
    pub fn new(child_account: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            child_account: child_account.into(),
            capacity,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue an event, waiting up to `patience` for space. If the queue is
    /// still full after that, the oldest queued event is evicted so the new
    /// one fits; the loss is counted and logged.
    pub async fn push(&self, event: ChangeEvent, patience: Duration) {
        let deadline = Instant::now() + patience;

        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return;
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(event);
                    self.readable.notify_one();
                    return;
                }
            }

            if timeout_at(deadline, self.writable.notified()).await.is_err() {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return;
                }
                if inner.items.len() >= self.capacity {
                    if let Some(evicted) = inner.items.pop_front() {
                        inner.dropped += 1;
                        warn!(
                            account = %self.child_account,
                            ticket = evicted.master_ticket(),
                            kind = evicted.kind(),
                            total_dropped = inner.dropped,
                            "Replication queue full past timeout, dropping oldest event"
                        );
                    }
                }
                inner.items.push_back(event);
                self.readable.notify_one();
                return;
            }
        }
    }

    /// Dequeue the next event in order. Returns `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<ChangeEvent> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(event) = inner.items.pop_front() {
                    self.writable.notify_one();
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close the queue; pending events remain consumable.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// Number of events lost to last-resort eviction.
    pub async fn dropped(&self) -> u64 {
        self.inner.lock().await.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeEvent;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn closed_event(ticket: u64) -> ChangeEvent {
        ChangeEvent::Closed {
            master_ticket: ticket,
            close_price: dec!(1.1),
            close_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fifo_ordering() {
        let queue = ReplicationQueue::new("child-1", 8);
        for ticket in 1..=3 {
            queue.push(closed_event(ticket), Duration::from_millis(10)).await;
        }

        for expected in 1..=3 {
            let event = queue.pop().await.unwrap();
            assert_eq!(event.master_ticket(), expected);
        }
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest_after_timeout() {
        let queue = ReplicationQueue::new("child-1", 2);
        queue.push(closed_event(1), Duration::from_millis(5)).await;
        queue.push(closed_event(2), Duration::from_millis(5)).await;
        // No consumer; this push must time out and evict ticket 1.
        queue.push(closed_event(3), Duration::from_millis(5)).await;

        assert_eq!(queue.dropped().await, 1);
        assert_eq!(queue.pop().await.unwrap().master_ticket(), 2);
        assert_eq!(queue.pop().await.unwrap().master_ticket(), 3);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = ReplicationQueue::new("child-1", 8);
        queue.push(closed_event(1), Duration::from_millis(5)).await;
        queue.close().await;

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(ReplicationQueue::new("child-1", 8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(closed_event(7), Duration::from_millis(5)).await;

        let event = consumer.await.unwrap().unwrap();
        assert_eq!(event.master_ticket(), 7);
    }
}
