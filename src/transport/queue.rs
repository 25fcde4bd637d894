//! Bounded inbound frame queue with drop-oldest overflow and a
//! deadline-aware wait, standing in for the "condition-variable wait with
//! deadline" the design doc's concurrency model calls for (§5). Built on a
//! plain `Mutex` + `tokio::sync::Notify` rather than a raw `Condvar` since
//! every consumer here is already an async task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::wire::Frame;

/// A decoded frame paired with the SNR the PHY estimated for it.
pub type InboundItem = (Frame, f32);

pub struct InboundQueue {
    inner: Mutex<VecDeque<InboundItem>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        InboundQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes a newly decoded item. If the queue is at capacity, the oldest
    /// item is dropped and the overflow counter incremented -- the only
    /// lossy step on the receive path beyond the physical channel.
    pub fn push(&self, item: InboundItem) {
        {
            let mut q = self.inner.lock().unwrap();
            if q.len() >= self.capacity {
                q.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(item);
        }
        self.notify.notify_waiters();
    }

    /// Pops the oldest item if any is queued right now (non-blocking).
    pub fn try_pop(&self) -> Option<InboundItem> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Waits for an item until `deadline`, returning `None` on timeout.
    /// Mirrors the round driver's "await votes until vote_deadline".
    pub async fn recv_until(&self, deadline: Instant) -> Option<InboundItem> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Dest, FrameMeta, MsgKind};
    use std::time::Duration;

    fn item(src: u8) -> InboundItem {
        let meta = FrameMeta::new(src, Dest::Broadcast, 0, MsgKind::Heartbeat);
        (Frame::new(meta, vec![]), 10.0)
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = InboundQueue::new(2);
        q.push(item(1));
        q.push(item(2));
        q.push(item(3));
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.len(), 2);
        let (f, _) = q.try_pop().unwrap();
        assert_eq!(f.meta.src, 2); // 1 was dropped
    }

    #[tokio::test]
    async fn recv_until_times_out() {
        let q = InboundQueue::new(4);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(q.recv_until(deadline).await.is_none());
    }

    #[tokio::test]
    async fn recv_until_wakes_on_push() {
        let q = std::sync::Arc::new(InboundQueue::new(4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            q2.push(item(9));
        });
        let deadline = Instant::now() + Duration::from_secs(1);
        let (f, _) = q.recv_until(deadline).await.unwrap();
        assert_eq!(f.meta.src, 9);
        handle.await.unwrap();
    }
}
