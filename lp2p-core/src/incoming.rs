//! Incoming queues: bounded FIFO of peer-initiated items exposed as a lazy,
//! non-restartable sequence.
//!
//! Used for inbound transports (bounded, backpressure via `TransportQueueFull`)
//! and for peer-created streams on a transport (unbounded).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Default capacity of an inbound transport queue.
pub const DEFAULT_INCOMING_TRANSPORT_CAPACITY: usize = 16;

struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: Option<usize>,
    wakers: Vec<Waker>,
    closed: bool,
    accepted: u64,
    yielded: u64,
    rejected: u64,
}

/// Why an item could not enter the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    Full,
    Closed,
}

/// Consumer handle. Clones share the same sequence: each element is yielded
/// exactly once, to whichever clone asks first. Once the owner closes the queue
/// and it drains, the sequence ends with `None`.
pub struct IncomingQueue<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
}

impl<T> Clone for IncomingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> IncomingQueue<T> {
    pub(crate) fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    pub(crate) fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                items: VecDeque::new(),
                capacity,
                wakers: Vec::new(),
                closed: false,
                accepted: 0,
                yielded: 0,
                rejected: 0,
            })),
        }
    }

    /// Producer side. Rejects when full or closed; the item is dropped by the caller.
    pub(crate) fn try_push(&self, item: T) -> Result<(), PushError> {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                inner.rejected += 1;
                return Err(PushError::Closed);
            }
            if inner.capacity.is_some_and(|cap| inner.items.len() >= cap) {
                inner.rejected += 1;
                return Err(PushError::Full);
            }
            inner.items.push_back(item);
            inner.accepted += 1;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// End the sequence. Items already queued are still yielded.
    pub(crate) fn close(&self) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            inner.closed = true;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// End the sequence now. Anything not yet taken is dropped: it belonged to
    /// the owner that is going away.
    pub(crate) fn abort(&self) {
        self.inner.borrow_mut().items.clear();
        self.close();
    }

    /// Drop queued elements that fail `keep`, leaving the sequence open.
    pub(crate) fn retain(&self, keep: impl FnMut(&T) -> bool) {
        self.inner.borrow_mut().items.retain(keep);
    }

    /// Take the next element without waiting.
    pub fn try_next(&self) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        let item = inner.items.pop_front();
        if item.is_some() {
            inner.yielded += 1;
        }
        item
    }

    /// Wait for the next element; `None` once the queue is closed and drained.
    pub fn next(&self) -> Next<'_, T> {
        Next { queue: self }
    }

    /// True once closed and drained: the sequence will yield nothing more.
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.borrow();
        inner.closed && inner.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    /// Elements ever accepted into the queue.
    pub fn accepted(&self) -> u64 {
        self.inner.borrow().accepted
    }

    /// Elements handed to the consumer.
    pub fn yielded(&self) -> u64 {
        self.inner.borrow().yielded
    }

    /// Push attempts refused (full or closed).
    pub fn rejected(&self) -> u64 {
        self.inner.borrow().rejected
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

}

/// Future returned by [`IncomingQueue::next`].
pub struct Next<'a, T> {
    queue: &'a IncomingQueue<T>,
}

impl<T> Future for Next<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.queue.inner.borrow_mut();
        if let Some(item) = inner.items.pop_front() {
            inner.yielded += 1;
            return Poll::Ready(Some(item));
        }
        if inner.closed {
            return Poll::Ready(None);
        }
        inner.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_single_consumption() {
        let queue = IncomingQueue::bounded(4);
        let other = queue.clone();
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(other.try_next(), Some(1));
        assert_eq!(queue.try_next(), Some(2));
        assert_eq!(queue.try_next(), None);
        assert_eq!(queue.yielded(), queue.accepted());
    }

    #[test]
    fn full_queue_rejects_without_dropping_existing() {
        let queue = IncomingQueue::bounded(2);
        queue.try_push("a").unwrap();
        queue.try_push("b").unwrap();
        assert_eq!(queue.try_push("c"), Err(PushError::Full));
        assert_eq!(queue.rejected(), 1);
        assert_eq!(queue.try_next(), Some("a"));
        queue.try_push("d").unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_drains_then_ends() {
        let queue = IncomingQueue::unbounded();
        queue.try_push(10).unwrap();
        queue.close();
        assert_eq!(queue.try_push(11), Err(PushError::Closed));
        assert!(!queue.is_finished());
        assert_eq!(queue.try_next(), Some(10));
        assert!(queue.is_finished());
    }

    #[test]
    fn aborted_queue_ends_immediately() {
        let queue = IncomingQueue::bounded(4);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        queue.abort();
        assert!(queue.is_finished());
        assert_eq!(queue.try_next(), None);
        assert_eq!(queue.try_push(3), Err(PushError::Closed));
        assert_eq!(queue.yielded(), 0);
    }

    #[test]
    fn retain_keeps_order_and_stays_open() {
        let queue = IncomingQueue::unbounded();
        for i in 1..=5 {
            queue.try_push(i).unwrap();
        }
        queue.retain(|i| i % 2 == 1);
        assert_eq!(queue.len(), 3);
        queue.try_push(7).unwrap();
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_next()).collect();
        assert_eq!(drained, vec![1, 3, 5, 7]);
        assert!(!queue.is_finished());
    }

    #[tokio::test]
    async fn next_ends_after_close() {
        let queue = IncomingQueue::bounded(1);
        queue.try_push(5u8).unwrap();
        queue.close();
        assert_eq!(queue.next().await, Some(5));
        assert_eq!(queue.next().await, None);
        assert_eq!(queue.next().await, None);
    }
}
