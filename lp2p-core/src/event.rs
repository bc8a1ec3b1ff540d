//! Event dispatch: handler slots and the ordered job queue.
//!
//! The core never calls application code while it holds its own state. It
//! queues a [`Job`] instead; the host drains the queue with
//! [`crate::Agent::dispatch`], one job at a time, so no two callbacks ever run
//! concurrently and every event for an entity arrives in the order it was queued.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::agent::Task;
use crate::channel::{ChannelState, DataChannel, Payload};
use crate::session::Session;
use crate::transport::{CloseInfo, TransportStream};

/// Default number of events a handler slot buffers before a callback is assigned.
pub const DEFAULT_EVENT_BUFFER_LIMIT: usize = 100;

type Callback<E> = Rc<dyn Fn(&E)>;

struct HandlerInner<E> {
    callback: Option<Callback<E>>,
    buffered: VecDeque<E>,
    limit: usize,
    closed: bool,
}

/// One assignable handler slot (`onmessage`, `onopen`, ...).
///
/// Events delivered while no callback is set are buffered and replayed, in
/// order, when one is assigned. Once closed the slot takes no new events, but
/// whatever it buffered before closing is still handed to the next callback
/// assigned, exactly once.
pub struct Handler<E> {
    inner: Rc<RefCell<HandlerInner<E>>>,
}

impl<E> Clone for Handler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> Handler<E> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(HandlerInner {
                callback: None,
                buffered: VecDeque::new(),
                limit,
                closed: false,
            })),
        }
    }

    /// Assign the callback, replacing any previous one. Buffered events are replayed first.
    /// On a closed slot the callback only receives that backlog and is not kept.
    pub fn set(&self, callback: impl Fn(&E) + 'static) {
        let callback: Callback<E> = Rc::new(callback);
        let replay = {
            let mut inner = self.inner.borrow_mut();
            if !inner.closed {
                inner.callback = Some(callback.clone());
            }
            std::mem::take(&mut inner.buffered)
        };
        for event in replay {
            callback(&event);
        }
    }

    /// Remove the callback; later events are buffered again.
    pub fn unset(&self) {
        self.inner.borrow_mut().callback = None;
    }

    pub(crate) fn deliver(&self, event: E) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            match &inner.callback {
                Some(cb) => cb.clone(),
                None => {
                    inner.buffered.push_back(event);
                    if inner.buffered.len() > inner.limit {
                        inner.buffered.pop_front();
                        tracing::warn!(limit = inner.limit, "event buffer overflow, dropped oldest");
                    }
                    return;
                }
            }
        };
        callback(&event);
    }

    /// Unsubscribe for good after the terminal event: drop the callback and
    /// refuse further events. The backlog stays until a callback takes it.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.callback = None;
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.inner.borrow().buffered.len()
    }
}

/// Unit of work on the dispatch queue.
pub(crate) enum Job {
    /// Hand an event to a handler slot.
    Deliver(Box<dyn FnOnce()>),
    /// A deferred state transition that must run after the events queued before it.
    Task(Task),
}

impl Job {
    pub(crate) fn deliver<E: 'static>(handler: &Handler<E>, event: E) -> Job {
        let handler = handler.clone();
        Job::Deliver(Box::new(move || handler.deliver(event)))
    }

    pub(crate) fn unsubscribe<E: 'static>(handler: &Handler<E>) -> Job {
        let handler = handler.clone();
        Job::Deliver(Box::new(move || handler.close()))
    }
}

/// FIFO of pending jobs for one agent.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    jobs: VecDeque<Job>,
}

impl EventDispatcher {
    pub(crate) fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub(crate) fn extend(&mut self, jobs: impl IntoIterator<Item = Job>) {
        self.jobs.extend(jobs);
    }

    pub(crate) fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// A Receiver accepted a request; carries the new Session.
#[derive(Clone)]
pub struct ConnectionEvent {
    pub connection: Session,
}

/// The peer created a channel on a Session.
#[derive(Clone)]
pub struct DataChannelEvent {
    pub channel: DataChannel,
}

/// A message arrived on a channel.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: Payload,
}

/// A channel changed state (`open`, `closing`, `close`).
#[derive(Clone)]
pub struct ChannelStateEvent {
    pub channel: DataChannel,
    pub state: ChannelState,
}

/// A channel failed; a `close` event follows.
#[derive(Clone)]
pub struct ChannelErrorEvent {
    pub channel: DataChannel,
    pub error: crate::Error,
}

/// The Session reached Closed.
#[derive(Clone)]
pub struct SessionCloseEvent {
    pub session: Session,
    /// True when the peer (or the loss of the connection) ended the session.
    pub remote: bool,
}

/// An unreliable datagram arrived on a transport.
#[derive(Debug, Clone)]
pub struct DatagramEvent {
    pub data: Vec<u8>,
}

/// Bytes (and possibly FIN) arrived on a transport stream.
#[derive(Clone)]
pub struct StreamDataEvent {
    pub stream: TransportStream,
    pub data: Vec<u8>,
    pub fin: bool,
}

/// A transport reached Closed.
#[derive(Debug, Clone)]
pub struct TransportCloseEvent {
    pub info: CloseInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn buffered_events_replay_in_order_on_set() {
        let handler = Handler::<u32>::new(DEFAULT_EVENT_BUFFER_LIMIT);
        handler.deliver(1);
        handler.deliver(2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e));
        handler.deliver(3);
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn buffer_drops_oldest_past_limit() {
        let handler = Handler::<u32>::new(2);
        for i in 0..5 {
            handler.deliver(i);
        }
        assert_eq!(handler.buffered_len(), 2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e));
        assert_eq!(*seen.borrow(), vec![3, 4]);
    }

    #[test]
    fn closed_handler_hands_backlog_to_next_callback_once() {
        let handler = Handler::<u32>::new(DEFAULT_EVENT_BUFFER_LIMIT);
        handler.deliver(1);
        handler.deliver(2);
        handler.close();
        handler.deliver(3);
        assert_eq!(handler.buffered_len(), 2);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e));
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(handler.buffered_len(), 0);

        handler.deliver(4);
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e + 100));
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn closed_handler_ignores_everything() {
        let handler = Handler::<u32>::new(DEFAULT_EVENT_BUFFER_LIMIT);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e));
        handler.close();
        handler.deliver(1);
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e));
        handler.deliver(2);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn dispatcher_is_fifo() {
        let mut dispatcher = EventDispatcher::default();
        let handler = Handler::<&'static str>::new(DEFAULT_EVENT_BUFFER_LIMIT);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        handler.set(move |e| sink.borrow_mut().push(*e));
        dispatcher.push(Job::deliver(&handler, "a"));
        dispatcher.push(Job::deliver(&handler, "b"));
        assert_eq!(dispatcher.len(), 2);
        while let Some(job) = dispatcher.pop() {
            if let Job::Deliver(f) = job {
                f();
            }
        }
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }
}
