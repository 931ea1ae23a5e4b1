use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Result, StatechartError};

/// What happens to an incoming item when a bounded mailbox is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the send with `MailboxFull`; the item is not enqueued.
    Reject,
    /// Silently drop the incoming item; the queue is unchanged.
    DropNewest,
    /// Silently drop the oldest queued item to make room for the new one.
    DropOldest,
}

#[derive(Debug, Clone, Copy)]
pub enum Capacity {
    Unbounded,
    Bounded(usize, OverflowPolicy),
}

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: Capacity,
}

/// A FIFO mailbox owned by one machine and drained by exactly one consumer
/// task. Cheaply cloneable — clones share the same underlying queue, which is
/// how the Orchestrator hands out a producer-side handle while the
/// interpreter task keeps its own handle to `recv` from.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
    id: String,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), id: self.id.clone() }
    }
}

impl<T> Mailbox<T> {
    pub fn new(id: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            inner: Arc::new(Inner { queue: Mutex::new(VecDeque::new()), notify: Notify::new(), closed: AtomicBool::new(false), capacity }),
            id: id.into(),
        }
    }

    /// Enqueues `item`, applying the configured overflow policy if the
    /// mailbox is bounded and full. Returns `MailboxFull` only under
    /// `Reject`; other policies never fail the call.
    pub fn try_send(&self, item: T) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut queue = self.inner.queue.lock().expect("mailbox queue poisoned");
        if let Capacity::Bounded(cap, policy) = self.inner.capacity {
            if queue.len() >= cap {
                match policy {
                    OverflowPolicy::Reject => return Err(StatechartError::MailboxFull { id: self.id.clone() }),
                    OverflowPolicy::DropNewest => return Ok(()),
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                    }
                }
            }
        }
        queue.push_back(item);
        drop(queue);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Waits for and removes the next item. Returns `None` once the mailbox
    /// has been closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("mailbox queue poisoned");
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks the mailbox closed and discards anything still queued, per the
    /// `stop()` contract: queued-but-unconsumed events are discarded.
    pub fn close_and_drain(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.lock().expect("mailbox queue poisoned").clear();
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().expect("mailbox queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let mailbox = Mailbox::new("m", Capacity::Unbounded);
        mailbox.try_send(1).unwrap();
        mailbox.try_send(2).unwrap();
        mailbox.try_send(3).unwrap();
        assert_eq!(mailbox.recv().await, Some(1));
        assert_eq!(mailbox.recv().await, Some(2));
        assert_eq!(mailbox.recv().await, Some(3));
    }

    #[tokio::test]
    async fn reject_policy_errors_when_full() {
        let mailbox = Mailbox::new("m", Capacity::Bounded(1, OverflowPolicy::Reject));
        mailbox.try_send(1).unwrap();
        assert!(matches!(mailbox.try_send(2), Err(StatechartError::MailboxFull { .. })));
    }

    #[tokio::test]
    async fn drop_newest_keeps_existing_queue() {
        let mailbox = Mailbox::new("m", Capacity::Bounded(1, OverflowPolicy::DropNewest));
        mailbox.try_send(1).unwrap();
        mailbox.try_send(2).unwrap();
        assert_eq!(mailbox.recv().await, Some(1));
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front() {
        let mailbox = Mailbox::new("m", Capacity::Bounded(1, OverflowPolicy::DropOldest));
        mailbox.try_send(1).unwrap();
        mailbox.try_send(2).unwrap();
        assert_eq!(mailbox.recv().await, Some(2));
    }

    #[tokio::test]
    async fn close_and_drain_wakes_pending_recv() {
        let mailbox: Mailbox<i32> = Mailbox::new("m", Capacity::Unbounded);
        let handle = mailbox.clone();
        let task = tokio::spawn(async move { handle.recv().await });
        tokio::task::yield_now().await;
        mailbox.close_and_drain();
        assert_eq!(task.await.unwrap(), None);
    }
}
