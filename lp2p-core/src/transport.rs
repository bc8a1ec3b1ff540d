//! Transport manager: QUIC-style transports pooled over a Session's connection.
//!
//! A transport carries bidirectional and unidirectional byte streams plus
//! unreliable datagrams. Peer-opened transports enter a bounded
//! [`IncomingQueue`]; when it is full the open is refused on the wire with
//! `TransportReject { QueueFull }` and the opener's `ready` fails with
//! `TransportQueueFull`.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::agent::{with_state, Effects, Task, WeakShared};
use crate::error::Error;
use crate::event::{DatagramEvent, Handler, Job, StreamDataEvent, TransportCloseEvent};
use crate::incoming::{IncomingQueue, PushError};
use crate::pending::{pair, Deferred, Pending};
use crate::protocol::{Message, StreamKind, TransportRejectReason};
use crate::session::{Role, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Ready,
    Closed,
}

/// Which end opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Close code and reason, as given to `close` on either end.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    pub code: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransportAddr {
    pub(crate) session: SessionId,
    pub(crate) id: u64,
}

#[derive(Clone)]
pub(crate) struct TransportHandlers {
    on_datagram: Handler<DatagramEvent>,
    on_close: Handler<TransportCloseEvent>,
}

/// State shared by the manager and every handle of one transport. Exists
/// before the transport is bound to a Session so a listener can hand out
/// transports ahead of the handshake.
pub(crate) struct TransportParts {
    binding: Rc<Cell<Option<TransportAddr>>>,
    ready: Deferred<()>,
    ready_pending: Pending<()>,
    closed: Deferred<CloseInfo>,
    closed_pending: Pending<CloseInfo>,
    incoming_streams: IncomingQueue<TransportStream>,
    handlers: TransportHandlers,
}

impl TransportParts {
    pub(crate) fn new(event_buffer_limit: usize) -> Self {
        let (ready, ready_pending) = pair();
        let (closed, closed_pending) = pair();
        Self {
            binding: Rc::new(Cell::new(None)),
            ready,
            ready_pending,
            closed,
            closed_pending,
            incoming_streams: IncomingQueue::unbounded(),
            handlers: TransportHandlers {
                on_datagram: Handler::new(event_buffer_limit),
                on_close: Handler::new(event_buffer_limit),
            },
        }
    }

    pub(crate) fn handle(&self, agent: WeakShared, direction: Direction) -> Transport {
        Transport {
            agent,
            direction,
            binding: self.binding.clone(),
            ready: self.ready_pending.clone(),
            closed: self.closed_pending.clone(),
            incoming_streams: self.incoming_streams.clone(),
            handlers: self.handlers.clone(),
        }
    }

    pub(crate) fn same_transport(&self, binding: &Rc<Cell<Option<TransportAddr>>>) -> bool {
        Rc::ptr_eq(&self.binding, binding)
    }

    /// Settle everything for a transport that never reached a Session.
    pub(crate) fn fail(&self, err: Error, jobs: &mut Vec<Job>) {
        self.ready.reject(err.clone());
        self.closed.reject(err);
        self.release(jobs);
    }

    /// Closed by the application before it was ever bound.
    pub(crate) fn close_unbound(&self, info: CloseInfo, jobs: &mut Vec<Job>) {
        self.ready.reject(Error::TransportClosed);
        self.closed.resolve(info.clone());
        jobs.push(Job::deliver(&self.handlers.on_close, TransportCloseEvent { info }));
        self.release(jobs);
    }

    fn release(&self, jobs: &mut Vec<Job>) {
        self.incoming_streams.close();
        jobs.push(Job::unsubscribe(&self.handlers.on_datagram));
        jobs.push(Job::unsubscribe(&self.handlers.on_close));
    }
}

struct StreamEntry {
    kind: StreamKind,
    local: bool,
    send_open: bool,
    recv_open: bool,
    on_data: Handler<StreamDataEvent>,
}

impl StreamEntry {
    fn new(kind: StreamKind, local: bool, limit: usize) -> Self {
        let bidi = kind == StreamKind::Bidirectional;
        Self {
            kind,
            local,
            send_open: local || bidi,
            recv_open: !local || bidi,
            on_data: Handler::new(limit),
        }
    }
}

struct TransportEntry {
    direction: Direction,
    state: TransportState,
    parts: TransportParts,
    streams: BTreeMap<u64, StreamEntry>,
    next_stream: u64,
}

impl TransportEntry {
    fn new(direction: Direction, parts: TransportParts) -> Self {
        Self {
            direction,
            state: TransportState::Connecting,
            parts,
            streams: BTreeMap::new(),
            // the opening side numbers its streams even, the accepting side odd
            next_stream: match direction {
                Direction::Outbound => 0,
                Direction::Inbound => 1,
            },
        }
    }

    fn usable(&self) -> Result<(), Error> {
        match self.state {
            TransportState::Ready => Ok(()),
            TransportState::Connecting => Err(Error::TransportNotReady),
            TransportState::Closed => Err(Error::TransportClosed),
        }
    }

    fn stream_handle(&self, agent: &WeakShared, addr: TransportAddr, id: u64) -> Option<TransportStream> {
        self.streams.get(&id).map(|s| TransportStream {
            agent: agent.clone(),
            addr,
            id,
            kind: s.kind,
            local: s.local,
            on_data: s.on_data.clone(),
        })
    }

    /// Move to Closed, ending the stream sequence and unsubscribing every handler.
    fn finish(&mut self, fx: &mut Effects) {
        self.state = TransportState::Closed;
        self.parts.release(&mut fx.jobs);
        for stream in self.streams.values() {
            fx.unsubscribe(&stream.on_data);
        }
    }
}

/// Creates and tracks the transports of one Session.
pub(crate) struct TransportManager {
    next_id: u64,
    transports: BTreeMap<u64, TransportEntry>,
    incoming: IncomingQueue<Transport>,
    listener: Option<IncomingQueue<Transport>>,
    event_buffer_limit: usize,
}

impl TransportManager {
    pub(crate) fn new(role: Role, capacity: usize, event_buffer_limit: usize) -> Self {
        Self {
            next_id: match role {
                Role::Receiver => 0,
                Role::Requester => 1,
            },
            transports: BTreeMap::new(),
            incoming: IncomingQueue::bounded(capacity),
            listener: None,
            event_buffer_limit,
        }
    }

    pub(crate) fn incoming(&self) -> IncomingQueue<Transport> {
        self.incoming.clone()
    }

    /// Send peer-opened transports to a listener queue instead of the Session's own.
    pub(crate) fn route_to(&mut self, listener: IncomingQueue<Transport>) {
        self.listener = Some(listener);
    }

    pub(crate) fn ids(&self) -> Vec<u64> {
        self.transports.keys().copied().collect()
    }

    pub(crate) fn state(&self, id: u64) -> Option<TransportState> {
        self.transports.get(&id).map(|t| t.state)
    }

    /// Open a new outbound transport.
    pub(crate) fn open(&mut self, fx: &mut Effects) -> Transport {
        let parts = TransportParts::new(self.event_buffer_limit);
        let transport = parts.handle(fx.agent.clone(), Direction::Outbound);
        self.adopt(parts, fx);
        transport
    }

    /// Bind an outbound transport (possibly created before this Session existed).
    pub(crate) fn adopt(&mut self, parts: TransportParts, fx: &mut Effects) {
        let id = self.next_id;
        self.next_id += 2;
        parts.binding.set(Some(TransportAddr {
            session: fx.session,
            id,
        }));
        self.transports
            .insert(id, TransportEntry::new(Direction::Outbound, parts));
        fx.send(Message::TransportOpen { id });
        tracing::debug!(session = %fx.session, transport = id, "transport connecting");
    }

    /// Peer opened a transport. Queued for the application, or refused when the queue is full.
    pub(crate) fn on_open(&mut self, id: u64, fx: &mut Effects) {
        if self.transports.contains_key(&id) {
            tracing::warn!(session = %fx.session, transport = id, "duplicate transport open ignored");
            return;
        }
        let parts = TransportParts::new(self.event_buffer_limit);
        let transport = parts.handle(fx.agent.clone(), Direction::Inbound);
        parts.binding.set(Some(TransportAddr {
            session: fx.session,
            id,
        }));
        let queue = self.listener.as_ref().unwrap_or(&self.incoming);
        match queue.try_push(transport) {
            Ok(()) => {
                self.transports
                    .insert(id, TransportEntry::new(Direction::Inbound, parts));
                fx.task(Task::AcceptTransport {
                    session: fx.session,
                    transport: id,
                });
            }
            Err(err) => {
                let reason = match err {
                    PushError::Full => TransportRejectReason::QueueFull,
                    PushError::Closed => TransportRejectReason::SessionClosing,
                };
                tracing::warn!(session = %fx.session, transport = id, ?reason, "inbound transport refused");
                fx.send(Message::TransportReject { id, reason });
            }
        }
    }

    /// Deferred half of an inbound open: Connecting becomes Ready after the
    /// transport has been queued.
    pub(crate) fn accept_inbound(&mut self, id: u64, fx: &mut Effects) {
        let Some(entry) = self.transports.get_mut(&id) else {
            return;
        };
        if entry.direction != Direction::Inbound || entry.state != TransportState::Connecting {
            return;
        }
        entry.state = TransportState::Ready;
        fx.send(Message::TransportAccept { id });
        entry.parts.ready.resolve(());
        tracing::debug!(session = %fx.session, transport = id, "inbound transport ready");
    }

    pub(crate) fn on_accept(&mut self, id: u64, fx: &mut Effects) {
        match self.transports.get_mut(&id) {
            Some(entry)
                if entry.direction == Direction::Outbound
                    && entry.state == TransportState::Connecting =>
            {
                entry.state = TransportState::Ready;
                entry.parts.ready.resolve(());
                tracing::debug!(session = %fx.session, transport = id, "transport ready");
            }
            _ => tracing::debug!(session = %fx.session, transport = id, "stray transport accept"),
        }
    }

    pub(crate) fn on_reject(&mut self, id: u64, reason: TransportRejectReason, fx: &mut Effects) {
        let Some(entry) = self.transports.get_mut(&id) else {
            return;
        };
        if entry.state != TransportState::Connecting {
            return;
        }
        let err = match reason {
            TransportRejectReason::QueueFull => Error::TransportQueueFull,
            TransportRejectReason::SessionClosing => Error::SessionClosed,
        };
        tracing::warn!(session = %fx.session, transport = id, %err, "transport refused by peer");
        entry.parts.ready.reject(err.clone());
        entry.parts.closed.reject(err);
        entry.finish(fx);
    }

    /// Local `close(code, reason)`. A no-op once Closed.
    pub(crate) fn close(&mut self, id: u64, info: CloseInfo, fx: &mut Effects) {
        if self.state(id).is_some_and(|s| s != TransportState::Closed) {
            fx.send(Message::TransportClose {
                id,
                code: info.code,
                reason: info.reason.clone(),
            });
            self.closed_with(id, info, fx);
        }
    }

    pub(crate) fn on_close(&mut self, id: u64, info: CloseInfo, fx: &mut Effects) {
        self.closed_with(id, info, fx);
    }

    fn closed_with(&mut self, id: u64, info: CloseInfo, fx: &mut Effects) {
        let Some(entry) = self.transports.get_mut(&id) else {
            return;
        };
        if entry.state == TransportState::Closed {
            return;
        }
        tracing::debug!(session = %fx.session, transport = id, code = info.code, "transport closed");
        entry.parts.ready.reject(Error::TransportClosed);
        entry.parts.closed.resolve(info.clone());
        fx.deliver(&entry.parts.handlers.on_close, TransportCloseEvent { info });
        entry.finish(fx);
    }

    /// Session teardown: every live transport fails with `SessionClosed` and
    /// the Session's incoming sequence ends without yielding what it still held.
    /// A listener shared with other Sessions only loses this Session's transports.
    pub(crate) fn abort_all(&mut self, fx: &mut Effects) {
        for (id, entry) in self.transports.iter_mut() {
            if entry.state == TransportState::Closed {
                continue;
            }
            tracing::debug!(session = %fx.session, transport = *id, "transport aborted with session");
            entry.parts.ready.reject(Error::SessionClosed);
            entry.parts.closed.reject(Error::SessionClosed);
            fx.deliver(
                &entry.parts.handlers.on_close,
                TransportCloseEvent {
                    info: CloseInfo {
                        code: 0,
                        reason: "session closed".into(),
                    },
                },
            );
            entry.finish(fx);
        }
        self.incoming.abort();
        if let Some(listener) = &self.listener {
            let session = fx.session;
            listener.retain(|t| t.session_id() != Some(session));
        }
    }

    pub(crate) fn create_stream(
        &mut self,
        id: u64,
        kind: StreamKind,
        fx: &mut Effects,
    ) -> Result<TransportStream, Error> {
        let limit = self.event_buffer_limit;
        let entry = self.transports.get_mut(&id).ok_or(Error::TransportClosed)?;
        entry.usable()?;
        let stream = entry.next_stream;
        entry.next_stream += 2;
        entry.streams.insert(stream, StreamEntry::new(kind, true, limit));
        fx.send(Message::StreamOpen {
            transport: id,
            stream,
            kind,
        });
        let addr = TransportAddr {
            session: fx.session,
            id,
        };
        entry
            .stream_handle(&fx.agent, addr, stream)
            .ok_or(Error::InvalidState("stream vanished during create"))
    }

    pub(crate) fn write(
        &mut self,
        id: u64,
        stream: u64,
        payload: Vec<u8>,
        fin: bool,
        fx: &mut Effects,
    ) -> Result<(), Error> {
        let entry = self.transports.get_mut(&id).ok_or(Error::TransportClosed)?;
        entry.usable()?;
        let s = entry
            .streams
            .get_mut(&stream)
            .ok_or(Error::InvalidState("unknown stream"))?;
        if !s.local && s.kind == StreamKind::Unidirectional {
            return Err(Error::InvalidState("stream is receive-only"));
        }
        if !s.send_open {
            return Err(Error::InvalidState("stream already finished"));
        }
        let msg = Message::StreamData {
            transport: id,
            stream,
            payload,
            fin,
        };
        fx.check_frame(&msg)?;
        if fin {
            s.send_open = false;
        }
        fx.send(msg);
        Ok(())
    }

    pub(crate) fn on_stream_open(&mut self, id: u64, stream: u64, kind: StreamKind, fx: &mut Effects) {
        let limit = self.event_buffer_limit;
        let Some(entry) = self.transports.get_mut(&id) else {
            return;
        };
        if entry.state != TransportState::Ready || entry.streams.contains_key(&stream) {
            tracing::warn!(session = %fx.session, transport = id, stream, "stream open ignored");
            return;
        }
        entry.streams.insert(stream, StreamEntry::new(kind, false, limit));
        let addr = TransportAddr {
            session: fx.session,
            id,
        };
        if let Some(handle) = entry.stream_handle(&fx.agent, addr, stream) {
            // unbounded queue: only fails once the transport has closed it
            let _ = entry.parts.incoming_streams.try_push(handle);
        }
    }

    pub(crate) fn on_stream_data(
        &mut self,
        id: u64,
        stream: u64,
        payload: Vec<u8>,
        fin: bool,
        fx: &mut Effects,
    ) {
        let Some(entry) = self.transports.get_mut(&id) else {
            return;
        };
        if entry.state != TransportState::Ready {
            return;
        }
        let addr = TransportAddr {
            session: fx.session,
            id,
        };
        let Some(handle) = entry.stream_handle(&fx.agent, addr, stream) else {
            tracing::warn!(session = %fx.session, transport = id, stream, "data for unknown stream");
            return;
        };
        let Some(s) = entry.streams.get_mut(&stream) else {
            return;
        };
        if !s.recv_open {
            tracing::warn!(session = %fx.session, transport = id, stream, "data on stream not readable");
            return;
        }
        let handler = s.on_data.clone();
        if fin {
            s.recv_open = false;
        }
        fx.deliver(
            &handler,
            StreamDataEvent {
                stream: handle,
                data: payload,
                fin,
            },
        );
    }

    pub(crate) fn send_datagram(&mut self, id: u64, payload: Vec<u8>, fx: &mut Effects) -> Result<(), Error> {
        let entry = self.transports.get(&id).ok_or(Error::TransportClosed)?;
        entry.usable()?;
        let msg = Message::Datagram {
            transport: id,
            payload,
        };
        fx.check_frame(&msg)?;
        fx.send(msg);
        Ok(())
    }

    pub(crate) fn on_datagram(&mut self, id: u64, payload: Vec<u8>, fx: &mut Effects) {
        match self.transports.get(&id) {
            Some(entry) if entry.state == TransportState::Ready => {
                fx.deliver(&entry.parts.handlers.on_datagram, DatagramEvent { data: payload });
            }
            // unreliable by definition
            _ => tracing::debug!(session = %fx.session, transport = id, "datagram dropped"),
        }
    }
}

/// Application handle to a transport.
#[derive(Clone)]
pub struct Transport {
    agent: WeakShared,
    direction: Direction,
    binding: Rc<Cell<Option<TransportAddr>>>,
    ready: Pending<()>,
    closed: Pending<CloseInfo>,
    incoming_streams: IncomingQueue<TransportStream>,
    handlers: TransportHandlers,
}

impl Transport {
    /// Id within its Session; None until bound to one.
    pub fn id(&self) -> Option<u64> {
        self.binding.get().map(|a| a.id)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.binding.get().map(|a| a.session)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> TransportState {
        match self.binding.get() {
            Some(addr) => with_state(&self.agent, |st| {
                st.session(addr.session)
                    .and_then(|s| s.transports.state(addr.id))
            })
            .flatten()
            .unwrap_or(TransportState::Closed),
            None if self.closed.is_settled() => TransportState::Closed,
            None => TransportState::Connecting,
        }
    }

    /// Resolves once usable; rejects if setup fails or the Session closes first.
    pub fn ready(&self) -> Pending<()> {
        self.ready.clone()
    }

    /// Resolves with the close info from either end; rejects with `SessionClosed`
    /// when torn down with its Session.
    pub fn closed(&self) -> Pending<CloseInfo> {
        self.closed.clone()
    }

    /// Streams opened by the peer, each yielded once.
    pub fn incoming_streams(&self) -> IncomingQueue<TransportStream> {
        self.incoming_streams.clone()
    }

    pub fn create_bidirectional_stream(&self) -> Result<TransportStream, Error> {
        self.create_stream(StreamKind::Bidirectional)
    }

    /// Send-only stream.
    pub fn create_unidirectional_stream(&self) -> Result<TransportStream, Error> {
        self.create_stream(StreamKind::Unidirectional)
    }

    fn create_stream(&self, kind: StreamKind) -> Result<TransportStream, Error> {
        let addr = self.bound()?;
        with_state(&self.agent, |st| {
            st.with_effects(addr.session, |s, fx| s.transports.create_stream(addr.id, kind, fx))
        })
        .flatten()
        .unwrap_or(Err(Error::TransportClosed))
    }

    pub fn send_datagram(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        let addr = self.bound()?;
        let data = data.into();
        with_state(&self.agent, |st| {
            st.with_effects(addr.session, |s, fx| s.transports.send_datagram(addr.id, data, fx))
        })
        .flatten()
        .unwrap_or(Err(Error::TransportClosed))
    }

    pub fn on_datagram(&self, f: impl Fn(&DatagramEvent) + 'static) {
        self.handlers.on_datagram.set(f);
    }

    pub fn on_close(&self, f: impl Fn(&TransportCloseEvent) + 'static) {
        self.handlers.on_close.set(f);
    }

    /// Close with an application code and reason; the peer sees the same pair.
    pub fn close(&self, code: u32, reason: &str) {
        let info = CloseInfo {
            code,
            reason: reason.to_string(),
        };
        match self.binding.get() {
            Some(addr) => {
                with_state(&self.agent, |st| {
                    st.with_effects(addr.session, |s, fx| s.transports.close(addr.id, info, fx));
                });
            }
            None => {
                with_state(&self.agent, |st| st.close_parked_transport(&self.binding, info));
            }
        }
    }

    fn bound(&self) -> Result<TransportAddr, Error> {
        match self.binding.get() {
            Some(addr) => Ok(addr),
            None if self.closed.is_settled() => Err(Error::TransportClosed),
            None => Err(Error::TransportNotReady),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("binding", &self.binding.get())
            .field("direction", &self.direction)
            .finish()
    }
}

/// One stream inside a transport.
#[derive(Clone)]
pub struct TransportStream {
    agent: WeakShared,
    addr: TransportAddr,
    id: u64,
    kind: StreamKind,
    local: bool,
    on_data: Handler<StreamDataEvent>,
}

impl TransportStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// True if this end opened the stream.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send(data.into(), false)
    }

    /// Half-close: the peer sees FIN after everything written so far.
    pub fn finish(&self) -> Result<(), Error> {
        self.send(Vec::new(), true)
    }

    fn send(&self, payload: Vec<u8>, fin: bool) -> Result<(), Error> {
        let addr = self.addr;
        let stream = self.id;
        with_state(&self.agent, |st| {
            st.with_effects(addr.session, |s, fx| {
                s.transports.write(addr.id, stream, payload, fin, fx)
            })
        })
        .flatten()
        .unwrap_or(Err(Error::TransportClosed))
    }

    pub fn on_data(&self, f: impl Fn(&StreamDataEvent) + 'static) {
        self.on_data.set(f);
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("transport", &self.addr)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameCodec;
    use std::rc::Weak;

    fn fx() -> Effects {
        Effects::new(Weak::new(), SessionId::from_bytes([3; 16]), FrameCodec::default())
    }

    fn sent(fx: &Effects) -> Vec<&Message> {
        fx.frames.iter().map(|(m, _)| m).collect()
    }

    #[test]
    fn outbound_ready_after_accept() {
        let mut mgr = TransportManager::new(Role::Requester, 4, 8);
        let mut f = fx();
        let t = mgr.open(&mut f);
        let id = t.id().unwrap();
        assert_eq!(id % 2, 1);
        assert!(matches!(sent(&f)[..], [Message::TransportOpen { .. }]));
        assert_eq!(mgr.state(id), Some(TransportState::Connecting));
        assert!(t.ready().try_result().is_none());
        mgr.on_accept(id, &mut f);
        assert_eq!(mgr.state(id), Some(TransportState::Ready));
        assert_eq!(t.ready().try_result(), Some(Ok(())));
    }

    #[test]
    fn streams_before_ready_fail() {
        let mut mgr = TransportManager::new(Role::Receiver, 4, 8);
        let mut f = fx();
        let t = mgr.open(&mut f);
        let id = t.id().unwrap();
        assert_eq!(
            mgr.create_stream(id, StreamKind::Bidirectional, &mut f).unwrap_err(),
            Error::TransportNotReady
        );
        assert_eq!(
            mgr.send_datagram(id, vec![1], &mut f),
            Err(Error::TransportNotReady)
        );
    }

    #[test]
    fn full_queue_refuses_on_the_wire() {
        let mut mgr = TransportManager::new(Role::Receiver, 2, 8);
        let mut f = fx();
        for id in [1, 3, 5] {
            mgr.on_open(id, &mut f);
        }
        assert_eq!(mgr.incoming().len(), 2);
        assert_eq!(mgr.incoming().rejected(), 1);
        assert!(sent(&f).iter().any(|m| matches!(
            m,
            Message::TransportReject {
                id: 5,
                reason: TransportRejectReason::QueueFull
            }
        )));
        assert_eq!(mgr.state(5), None);
    }

    #[test]
    fn rejected_open_fails_ready_with_queue_full() {
        let mut mgr = TransportManager::new(Role::Requester, 4, 8);
        let mut f = fx();
        let t = mgr.open(&mut f);
        let id = t.id().unwrap();
        mgr.on_reject(id, TransportRejectReason::QueueFull, &mut f);
        assert_eq!(t.ready().try_result(), Some(Err(Error::TransportQueueFull)));
        assert_eq!(mgr.state(id), Some(TransportState::Closed));
    }

    #[test]
    fn abort_rejects_pending_and_ends_incoming() {
        let mut mgr = TransportManager::new(Role::Receiver, 4, 8);
        let mut f = fx();
        let t = mgr.open(&mut f);
        mgr.on_open(1, &mut f);
        mgr.abort_all(&mut f);
        assert_eq!(t.ready().try_result(), Some(Err(Error::SessionClosed)));
        assert_eq!(t.closed().try_result(), Some(Err(Error::SessionClosed)));
        let queue = mgr.incoming();
        assert!(queue.try_next().is_some());
        assert!(queue.is_finished());
    }

    #[test]
    fn receive_only_stream_rejects_writes() {
        let mut mgr = TransportManager::new(Role::Receiver, 4, 8);
        let mut f = fx();
        mgr.on_open(1, &mut f);
        mgr.accept_inbound(1, &mut f);
        mgr.on_stream_open(1, 0, StreamKind::Unidirectional, &mut f);
        assert_eq!(
            mgr.write(1, 0, b"x".to_vec(), false, &mut f),
            Err(Error::InvalidState("stream is receive-only"))
        );
        let local = mgr.create_stream(1, StreamKind::Bidirectional, &mut f).unwrap();
        assert_eq!(local.id(), 1);
        mgr.write(1, local.id(), b"x".to_vec(), true, &mut f).unwrap();
        assert_eq!(
            mgr.write(1, local.id(), b"y".to_vec(), false, &mut f),
            Err(Error::InvalidState("stream already finished"))
        );
    }

    #[test]
    fn close_is_idempotent() {
        let mut mgr = TransportManager::new(Role::Requester, 4, 8);
        let mut f = fx();
        let t = mgr.open(&mut f);
        let id = t.id().unwrap();
        mgr.on_accept(id, &mut f);
        let info = CloseInfo {
            code: 7,
            reason: "done".into(),
        };
        mgr.close(id, info.clone(), &mut f);
        mgr.close(id, info.clone(), &mut f);
        let closes = sent(&f)
            .into_iter()
            .filter(|m| matches!(m, Message::TransportClose { .. }))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(t.closed().try_result(), Some(Ok(info)));
        assert_eq!(
            mgr.send_datagram(id, vec![], &mut f),
            Err(Error::TransportClosed)
        );
    }
}
