//! Handshake coordinator: turns the asymmetric Receiver / Requester roles into
//! one symmetric Session.
//!
//! Receiver: `Idle -> Listening -> Stopped`. While Listening it accepts any
//! number of requests addressed to its nickname, each yielding its own Session.
//!
//! Requester: `Idle -> Pending -> {Established, Closed}`. A request resolves
//! the rendezvous nickname to endpoints, dials them in turn, and settles with
//! the Session, `PeerUnavailable`, `HandshakeTimeout`, or `Cancelled`.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::agent::{with_state, AgentState, ConnectionId, DialId, Link, OutboundAction, Task, WeakShared};
use crate::error::Error;
use crate::event::{ConnectionEvent, Handler, Job};
use crate::incoming::IncomingQueue;
use crate::pending::{pair, Deferred, Pending};
use crate::protocol::{Message, RejectReason};
use crate::rendezvous::PeerEndpoint;
use crate::session::{Role, Session, SessionEntry, SessionId, Source};
use crate::transport::{CloseInfo, Direction, Transport, TransportAddr, TransportParts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Listening,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Pending,
    Established,
    /// Failed, cancelled, or its Session ended. `start()` may be called again.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Nickname to advertise.
    pub nickname: String,
    /// Upper bound on concurrently established sessions; further requests are refused as busy.
    pub max_sessions: Option<usize>,
}

impl ReceiverOptions {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            max_sessions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Nickname of the Receiver to connect to.
    pub nickname: String,
    /// Nickname presented to the Receiver.
    pub local_nickname: Option<String>,
}

impl RequestOptions {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            local_nickname: None,
        }
    }
}

/// A connect request as seen by a Receiver's accept policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub from: String,
    pub to: String,
}

pub(crate) type AcceptPolicy = Rc<dyn Fn(&IncomingRequest) -> bool>;

/// Queue that collects peer-opened transports from every Session of one source.
struct ListenerSink {
    queue: IncomingQueue<Transport>,
    ready: Deferred<()>,
    ready_pending: Pending<()>,
}

impl ListenerSink {
    fn new(capacity: usize) -> Self {
        let (ready, ready_pending) = pair();
        Self {
            queue: IncomingQueue::bounded(capacity),
            ready,
            ready_pending,
        }
    }

    fn listener(&self) -> TransportListener {
        TransportListener {
            ready: self.ready_pending.clone(),
            incoming: self.queue.clone(),
        }
    }

    fn end(&self, err: Option<Error>) {
        if let Some(err) = err {
            self.ready.reject(err);
        }
        self.queue.close();
    }
}

/// Transports accepted on behalf of a Receiver or Request rather than a single Session.
#[derive(Clone)]
pub struct TransportListener {
    ready: Pending<()>,
    incoming: IncomingQueue<Transport>,
}

impl TransportListener {
    /// Resolves once the source is Listening (Receiver) or Established (Requester).
    pub fn ready(&self) -> Pending<()> {
        self.ready.clone()
    }

    /// Peer-opened transports of every Session the source produces. Ends once
    /// the source is stopped and none of its Sessions remain.
    pub fn incoming(&self) -> IncomingQueue<Transport> {
        self.incoming.clone()
    }
}

struct ReceiverEntry {
    nickname: String,
    state: ReceiverState,
    max_sessions: Option<usize>,
    policy: Option<AcceptPolicy>,
    started: Option<Deferred<Session>>,
    sessions: Vec<SessionId>,
    on_connection: Handler<ConnectionEvent>,
    listener: Option<ListenerSink>,
    parked: Vec<TransportParts>,
}

struct RequestEntry {
    target: String,
    local_nickname: String,
    state: RequestState,
    started: Option<Deferred<Session>>,
    endpoints: VecDeque<PeerEndpoint>,
    dial: Option<DialId>,
    connection: Option<ConnectionId>,
    deadline: Option<u64>,
    last_error: Option<String>,
    session: Option<SessionId>,
    listener: Option<ListenerSink>,
    parked: Vec<TransportParts>,
}

#[derive(Default)]
pub(crate) struct HandshakeCoordinator {
    next_key: u64,
    receivers: HashMap<u64, ReceiverEntry>,
    requests: HashMap<u64, RequestEntry>,
    dials: HashMap<DialId, u64>,
}

impl HandshakeCoordinator {
    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    pub(crate) fn policy(&self, receiver: u64) -> Option<AcceptPolicy> {
        self.receivers.get(&receiver).and_then(|r| r.policy.clone())
    }

    pub(crate) fn listening_receiver(&self, nickname: &str) -> Option<u64> {
        self.receivers
            .iter()
            .find(|(_, r)| r.state == ReceiverState::Listening && r.nickname == nickname)
            .map(|(&key, _)| key)
    }

    pub(crate) fn has_pending_requests(&self) -> bool {
        self.requests
            .values()
            .any(|r| r.state == RequestState::Pending)
    }
}

fn rejected<T>(err: Error) -> Pending<T> {
    let (deferred, pending) = pair();
    deferred.reject(err);
    pending
}

impl AgentState {
    pub(crate) fn new_receiver(&mut self, options: ReceiverOptions) -> Receiver {
        let key = self.handshake.key();
        let on_connection = Handler::new(self.config.event_buffer_limit);
        self.handshake.receivers.insert(
            key,
            ReceiverEntry {
                nickname: options.nickname.clone(),
                state: ReceiverState::Idle,
                max_sessions: options.max_sessions,
                policy: None,
                started: None,
                sessions: Vec::new(),
                on_connection: on_connection.clone(),
                listener: None,
                parked: Vec::new(),
            },
        );
        Receiver {
            agent: self.self_ref.clone(),
            key,
            nickname: options.nickname,
            on_connection,
        }
    }

    pub(crate) fn new_request(&mut self, options: RequestOptions) -> Request {
        let key = self.handshake.key();
        self.handshake.requests.insert(
            key,
            RequestEntry {
                target: options.nickname.clone(),
                local_nickname: options.local_nickname.unwrap_or_default(),
                state: RequestState::Idle,
                started: None,
                endpoints: VecDeque::new(),
                dial: None,
                connection: None,
                deadline: None,
                last_error: None,
                session: None,
                listener: None,
                parked: Vec::new(),
            },
        );
        Request {
            agent: self.self_ref.clone(),
            key,
            target: options.nickname,
        }
    }

    fn start_receiver(&mut self, key: u64) -> Pending<Session> {
        let Some(entry) = self.handshake.receivers.get(&key) else {
            return rejected(Error::InvalidState("receiver dropped"));
        };
        if entry.state == ReceiverState::Listening {
            return rejected(Error::InvalidState("receiver already listening"));
        }
        if self.handshake.listening_receiver(&entry.nickname).is_some() {
            return rejected(Error::InvalidState("nickname already advertised"));
        }
        let (deferred, pending) = pair();
        let Some(entry) = self.handshake.receivers.get_mut(&key) else {
            return rejected(Error::InvalidState("receiver dropped"));
        };
        entry.state = ReceiverState::Listening;
        entry.started = Some(deferred);
        let nickname = entry.nickname.clone();
        tracing::info!(nickname = %nickname, "receiver listening");
        self.push_action(OutboundAction::Advertise { nickname });
        pending
    }

    fn stop_receiver(&mut self, key: u64) {
        let Some(entry) = self.handshake.receivers.get_mut(&key) else {
            return;
        };
        if entry.state != ReceiverState::Listening {
            return;
        }
        entry.state = ReceiverState::Stopped;
        if let Some(started) = entry.started.take() {
            started.reject(Error::Cancelled);
        }
        let mut jobs = Vec::new();
        for parts in entry.parked.drain(..) {
            parts.fail(
                Error::TransportSetupFailed("receiver stopped".into()),
                &mut jobs,
            );
        }
        if entry.sessions.is_empty() {
            if let Some(listener) = entry.listener.take() {
                listener.end(None);
            }
        }
        let nickname = entry.nickname.clone();
        tracing::info!(nickname = %nickname, sessions = entry.sessions.len(), "receiver stopped");
        self.dispatcher.extend(jobs);
        self.push_action(OutboundAction::Withdraw { nickname });
    }

    /// A ConnectRequest arrived on an inbound connection.
    pub(crate) fn on_connect_request(&mut self, connection: ConnectionId, request_id: u64, from: String, to: String) {
        match self.handshake.listening_receiver(&to) {
            Some(receiver) => {
                self.connections.insert(connection, Link::Deciding);
                self.dispatcher.push(Job::Task(Task::ResolveRequest {
                    receiver,
                    connection,
                    request_id,
                    request: IncomingRequest { from, to },
                }));
            }
            None => {
                tracing::info!(to = %to, from = %from, "connect request for unknown nickname");
                self.reject_request(connection, request_id, RejectReason::NoReceiver);
            }
        }
    }

    fn reject_request(&mut self, connection: ConnectionId, request_id: u64, reason: RejectReason) {
        self.send_to(connection, &Message::ConnectReject { request_id, reason });
        self.connections.remove(&connection);
    }

    /// Second half of a ConnectRequest, after the accept policy has run.
    pub(crate) fn resolve_request(
        &mut self,
        key: u64,
        connection: ConnectionId,
        request_id: u64,
        request: IncomingRequest,
        accepted: bool,
    ) {
        if self.connections.get(&connection) != Some(&Link::Deciding) {
            tracing::debug!(?connection, "requester left before decision");
            return;
        }
        let Some(entry) = self.handshake.receivers.get(&key) else {
            self.reject_request(connection, request_id, RejectReason::NoReceiver);
            return;
        };
        let refusal = if entry.state != ReceiverState::Listening {
            Some(RejectReason::Stopped)
        } else if !accepted {
            Some(RejectReason::Declined)
        } else if entry
            .max_sessions
            .is_some_and(|max| entry.sessions.len() >= max)
        {
            Some(RejectReason::Busy)
        } else {
            None
        };
        if let Some(reason) = refusal {
            tracing::info!(from = %request.from, nickname = %entry.nickname, %reason, "connect request refused");
            self.reject_request(connection, request_id, reason);
            return;
        }

        let sid = SessionId::random();
        let session = SessionEntry::new(
            sid,
            Role::Receiver,
            entry.nickname.clone(),
            request.from,
            connection,
            Source::Receiver(key),
            &self.config,
        );
        self.connections.insert(connection, Link::Session(sid));
        self.send_to(
            connection,
            &Message::ConnectAccept {
                request_id,
                session_id: *sid.as_bytes(),
            },
        );
        self.install_session(session, Source::Receiver(key));
    }

    /// Register a fresh Session, settle whoever waited for it, and hand it any
    /// listener routing and parked transports of its source.
    fn install_session(&mut self, mut session: SessionEntry, source: Source) {
        let sid = session.id;
        let handle = session.handle(self.self_ref.clone());
        let (listener, parked) = match source {
            Source::Receiver(key) => {
                let Some(entry) = self.handshake.receivers.get_mut(&key) else {
                    return;
                };
                entry.sessions.push(sid);
                if let Some(started) = entry.started.take() {
                    started.resolve(handle.clone());
                }
                self.dispatcher.push(Job::deliver(
                    &entry.on_connection,
                    ConnectionEvent {
                        connection: handle.clone(),
                    },
                ));
                (
                    entry.listener.as_ref().map(|l| l.queue.clone()),
                    std::mem::take(&mut entry.parked),
                )
            }
            Source::Request(key) => {
                let Some(entry) = self.handshake.requests.get_mut(&key) else {
                    return;
                };
                entry.state = RequestState::Established;
                entry.session = Some(sid);
                entry.connection = None;
                entry.deadline = None;
                if let Some(started) = entry.started.take() {
                    started.resolve(handle.clone());
                }
                if let Some(listener) = &entry.listener {
                    listener.ready.resolve(());
                }
                (
                    entry.listener.as_ref().map(|l| l.queue.clone()),
                    std::mem::take(&mut entry.parked),
                )
            }
        };
        if let Some(queue) = listener {
            session.transports.route_to(queue);
        }
        tracing::info!(
            session = %sid,
            role = ?session.role,
            local = %session.local_nickname,
            remote = %session.remote_nickname,
            "session established"
        );
        self.sessions.insert(sid, session);
        for parts in parked {
            self.with_effects(sid, |s, fx| s.transports.adopt(parts, fx));
        }
    }

    fn start_request(&mut self, key: u64) -> Pending<Session> {
        let timeout = self.config.handshake_timeout_ticks;
        let now = self.ticks;
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            return rejected(Error::InvalidState("request dropped"));
        };
        match entry.state {
            RequestState::Pending => return rejected(Error::InvalidState("request already pending")),
            RequestState::Established => {
                return rejected(Error::InvalidState("request already established"))
            }
            RequestState::Idle | RequestState::Closed => {}
        }
        let (deferred, pending) = pair();
        entry.state = RequestState::Pending;
        entry.started = Some(deferred);
        entry.deadline = (timeout > 0).then(|| now + timeout);
        entry.last_error = None;
        entry.session = None;
        let target = entry.target.clone();
        tracing::debug!(target = %target, "request pending");
        match self.rendezvous.resolve(&target) {
            Ok(endpoints) if !endpoints.is_empty() => {
                if let Some(entry) = self.handshake.requests.get_mut(&key) {
                    entry.endpoints = endpoints.into();
                }
                self.dial_next(key);
            }
            Ok(_) => self.fail_request(key, Error::PeerUnavailable(format!("no endpoint for {target}"))),
            Err(err) => self.fail_request(key, err),
        }
        pending
    }

    fn dial_next(&mut self, key: u64) {
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            return;
        };
        match entry.endpoints.pop_front() {
            Some(endpoint) => {
                let dial = DialId(self.next_dial);
                self.next_dial += 1;
                entry.dial = Some(dial);
                self.handshake.dials.insert(dial, key);
                tracing::debug!(target = %entry.target, address = %endpoint.address, "dialing");
                self.push_action(OutboundAction::Dial { dial, endpoint });
            }
            None => {
                let reason = entry
                    .last_error
                    .take()
                    .unwrap_or_else(|| "no reachable endpoint".into());
                self.fail_request(key, Error::PeerUnavailable(reason));
            }
        }
    }

    fn fail_request(&mut self, key: u64, err: Error) {
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            return;
        };
        entry.state = RequestState::Closed;
        entry.endpoints.clear();
        entry.deadline = None;
        if let Some(dial) = entry.dial.take() {
            self.handshake.dials.remove(&dial);
        }
        if let Some(started) = entry.started.take() {
            started.reject(err.clone());
        }
        if let Some(listener) = entry.listener.take() {
            listener.end(Some(err.clone()));
        }
        let mut jobs = Vec::new();
        for parts in entry.parked.drain(..) {
            parts.fail(Error::TransportSetupFailed(err.to_string()), &mut jobs);
        }
        let connection = entry.connection.take();
        tracing::info!(target = %entry.target, %err, "request failed");
        self.dispatcher.extend(jobs);
        if let Some(connection) = connection {
            self.connections.remove(&connection);
            self.push_action(OutboundAction::Close { connection });
        }
    }

    fn cancel_request(&mut self, key: u64) {
        if self
            .handshake
            .requests
            .get(&key)
            .is_some_and(|r| r.state == RequestState::Pending)
        {
            self.fail_request(key, Error::Cancelled);
        }
    }

    pub(crate) fn on_dial_result(&mut self, dial: DialId, result: Result<ConnectionId, Error>) {
        let live = self.handshake.dials.remove(&dial).filter(|key| {
            self.handshake
                .requests
                .get(key)
                .is_some_and(|e| e.state == RequestState::Pending && e.dial == Some(dial))
        });
        match (result, live) {
            (Ok(connection), Some(key)) => {
                let Some(entry) = self.handshake.requests.get_mut(&key) else {
                    return;
                };
                entry.dial = None;
                entry.connection = Some(connection);
                let msg = Message::ConnectRequest {
                    request_id: key,
                    from: entry.local_nickname.clone(),
                    to: entry.target.clone(),
                };
                self.connections.insert(connection, Link::Requesting(key));
                self.send_to(connection, &msg);
            }
            (Ok(connection), None) => {
                tracing::debug!(?dial, "late dial result, closing");
                self.push_action(OutboundAction::Close { connection });
            }
            (Err(err), Some(key)) => {
                if let Some(entry) = self.handshake.requests.get_mut(&key) {
                    tracing::debug!(target = %entry.target, %err, "dial failed");
                    entry.dial = None;
                    entry.last_error = Some(err.to_string());
                }
                self.dial_next(key);
            }
            (Err(_), None) => {}
        }
    }

    pub(crate) fn on_connect_accept(&mut self, connection: ConnectionId, key: u64, request_id: u64, session_id: [u8; 16]) {
        let Some(entry) = self.handshake.requests.get(&key) else {
            return;
        };
        if request_id != key || entry.state != RequestState::Pending || entry.connection != Some(connection) {
            tracing::warn!(?connection, request_id, "unexpected connect accept");
            return;
        }
        let sid = SessionId::from_bytes(session_id);
        if self.sessions.contains_key(&sid) {
            self.fail_request(key, Error::PeerUnavailable("session id collision".into()));
            return;
        }
        let session = SessionEntry::new(
            sid,
            Role::Requester,
            entry.local_nickname.clone(),
            entry.target.clone(),
            connection,
            Source::Request(key),
            &self.config,
        );
        self.connections.insert(connection, Link::Session(sid));
        self.install_session(session, Source::Request(key));
    }

    pub(crate) fn on_connect_reject(&mut self, connection: ConnectionId, key: u64, reason: RejectReason) {
        self.connections.remove(&connection);
        self.push_action(OutboundAction::Close { connection });
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            return;
        };
        if entry.state != RequestState::Pending || entry.connection != Some(connection) {
            return;
        }
        entry.connection = None;
        tracing::info!(target = %entry.target, %reason, "connect request rejected");
        if reason == RejectReason::Stopped {
            self.fail_request(key, Error::Cancelled);
        } else {
            entry.last_error = Some(reason.to_string());
            self.dial_next(key);
        }
    }

    /// The raw connection of a pending request went away before an answer.
    pub(crate) fn on_request_connection_lost(&mut self, key: u64) {
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            return;
        };
        if entry.state != RequestState::Pending {
            return;
        }
        entry.connection = None;
        entry.last_error = Some("connection lost during handshake".into());
        self.dial_next(key);
    }

    /// Fail every pending request whose deadline has passed.
    pub(crate) fn expire_requests(&mut self) {
        let now = self.ticks;
        let expired: Vec<u64> = self
            .handshake
            .requests
            .iter()
            .filter(|(_, r)| r.state == RequestState::Pending && r.deadline.is_some_and(|d| d <= now))
            .map(|(&key, _)| key)
            .collect();
        for key in expired {
            self.fail_request(key, Error::HandshakeTimeout);
        }
    }

    /// Bookkeeping after a Session of this source closed.
    pub(crate) fn session_ended(&mut self, source: Source, sid: SessionId) {
        match source {
            Source::Receiver(key) => {
                if let Some(entry) = self.handshake.receivers.get_mut(&key) {
                    entry.sessions.retain(|s| *s != sid);
                    if entry.state == ReceiverState::Stopped && entry.sessions.is_empty() {
                        if let Some(listener) = entry.listener.take() {
                            listener.end(None);
                        }
                    }
                }
            }
            Source::Request(key) => {
                if let Some(entry) = self.handshake.requests.get_mut(&key) {
                    if entry.session == Some(sid) {
                        entry.state = RequestState::Closed;
                        entry.session = None;
                        if let Some(listener) = entry.listener.take() {
                            listener.end(None);
                        }
                    }
                }
            }
        }
    }

    fn receiver_listener(&mut self, key: u64) -> TransportListener {
        let capacity = self.config.incoming_transport_capacity;
        let Some(entry) = self.handshake.receivers.get(&key) else {
            let sink = ListenerSink::new(capacity);
            sink.end(Some(Error::InvalidState("receiver dropped")));
            return sink.listener();
        };
        if let Some(listener) = entry.listener.as_ref().filter(|l| !l.queue.is_closed()) {
            return listener.listener();
        }
        if entry.state != ReceiverState::Listening {
            let started = self.start_receiver(key);
            if let Some(Err(err)) = started.try_result() {
                let sink = ListenerSink::new(capacity);
                sink.end(Some(err));
                return sink.listener();
            }
        }
        let sink = ListenerSink::new(capacity);
        sink.ready.resolve(());
        let listener = sink.listener();
        let sessions = match self.handshake.receivers.get_mut(&key) {
            Some(entry) => {
                let sessions = entry.sessions.clone();
                entry.listener = Some(sink);
                sessions
            }
            None => Vec::new(),
        };
        for sid in sessions {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.transports.route_to(listener.incoming.clone());
            }
        }
        listener
    }

    fn request_listener(&mut self, key: u64) -> TransportListener {
        let capacity = self.config.incoming_transport_capacity;
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            let sink = ListenerSink::new(capacity);
            sink.end(Some(Error::InvalidState("request dropped")));
            return sink.listener();
        };
        if let Some(listener) = entry.listener.as_ref().filter(|l| !l.queue.is_closed()) {
            return listener.listener();
        }
        let sink = ListenerSink::new(capacity);
        let listener = sink.listener();
        let state = entry.state;
        let session = entry.session;
        entry.listener = Some(sink);
        match (state, session) {
            (RequestState::Established, Some(sid)) => {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.transports.route_to(listener.incoming.clone());
                }
                if let Some(sink) = self
                    .handshake
                    .requests
                    .get(&key)
                    .and_then(|e| e.listener.as_ref())
                {
                    sink.ready.resolve(());
                }
            }
            (RequestState::Idle | RequestState::Closed, _) => {
                self.start_request(key);
            }
            _ => {}
        }
        listener
    }

    fn receiver_open_transport(&mut self, key: u64) -> Transport {
        let parts = TransportParts::new(self.config.event_buffer_limit);
        let transport = parts.handle(self.self_ref.clone(), Direction::Outbound);
        let Some(entry) = self.handshake.receivers.get(&key) else {
            let mut jobs = Vec::new();
            parts.fail(Error::TransportSetupFailed("receiver dropped".into()), &mut jobs);
            self.dispatcher.extend(jobs);
            return transport;
        };
        if let Some(&sid) = entry.sessions.first() {
            self.with_effects(sid, |s, fx| s.transports.adopt(parts, fx));
            return transport;
        }
        match entry.state {
            ReceiverState::Stopped => {
                let mut jobs = Vec::new();
                parts.fail(Error::TransportSetupFailed("receiver stopped".into()), &mut jobs);
                self.dispatcher.extend(jobs);
            }
            ReceiverState::Idle | ReceiverState::Listening => {
                let idle = entry.state == ReceiverState::Idle;
                if let Some(entry) = self.handshake.receivers.get_mut(&key) {
                    entry.parked.push(parts);
                }
                if idle {
                    let started = self.start_receiver(key);
                    if let Some(Err(err)) = started.try_result() {
                        self.fail_parked_receiver(key, err);
                    }
                }
            }
        }
        transport
    }

    fn fail_parked_receiver(&mut self, key: u64, err: Error) {
        let mut jobs = Vec::new();
        if let Some(entry) = self.handshake.receivers.get_mut(&key) {
            for parts in entry.parked.drain(..) {
                parts.fail(Error::TransportSetupFailed(err.to_string()), &mut jobs);
            }
        }
        self.dispatcher.extend(jobs);
    }

    fn request_open_transport(&mut self, key: u64) -> Transport {
        let parts = TransportParts::new(self.config.event_buffer_limit);
        let transport = parts.handle(self.self_ref.clone(), Direction::Outbound);
        let Some(entry) = self.handshake.requests.get_mut(&key) else {
            let mut jobs = Vec::new();
            parts.fail(Error::TransportSetupFailed("request dropped".into()), &mut jobs);
            self.dispatcher.extend(jobs);
            return transport;
        };
        match (entry.state, entry.session) {
            (RequestState::Established, Some(sid)) => {
                self.with_effects(sid, |s, fx| s.transports.adopt(parts, fx));
            }
            (state, _) => {
                entry.parked.push(parts);
                if matches!(state, RequestState::Idle | RequestState::Closed) {
                    self.start_request(key);
                }
            }
        }
        transport
    }

    /// Close a transport that is still waiting for its source's Session.
    pub(crate) fn close_parked_transport(&mut self, binding: &Rc<Cell<Option<TransportAddr>>>, info: CloseInfo) {
        let parked = self
            .handshake
            .receivers
            .values_mut()
            .map(|r| &mut r.parked)
            .chain(self.handshake.requests.values_mut().map(|r| &mut r.parked));
        let mut found = None;
        for list in parked {
            if let Some(pos) = list.iter().position(|p| p.same_transport(binding)) {
                found = Some(list.remove(pos));
                break;
            }
        }
        if let Some(parts) = found {
            let mut jobs = Vec::new();
            parts.close_unbound(info, &mut jobs);
            self.dispatcher.extend(jobs);
        }
    }

    fn receiver_sessions(&self, key: u64) -> Vec<Session> {
        self.handshake
            .receivers
            .get(&key)
            .map(|r| {
                r.sessions
                    .iter()
                    .filter_map(|sid| self.sessions.get(sid))
                    .map(|s| s.handle(self.self_ref.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Application handle for the Receiver role.
#[derive(Clone)]
pub struct Receiver {
    agent: WeakShared,
    key: u64,
    nickname: String,
    on_connection: Handler<ConnectionEvent>,
}

impl Receiver {
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn state(&self) -> ReceiverState {
        with_state(&self.agent, |st| {
            st.handshake.receivers.get(&self.key).map(|r| r.state)
        })
        .flatten()
        .unwrap_or(ReceiverState::Stopped)
    }

    /// Advertise the nickname and listen. Resolves with the first Session
    /// established after this call, or fails with `Cancelled` on `stop()`.
    pub fn start(&self) -> Pending<Session> {
        with_state(&self.agent, |st| st.start_receiver(self.key))
            .unwrap_or_else(|| rejected(Error::InvalidState("agent dropped")))
    }

    /// Withdraw the nickname. Established Sessions are unaffected.
    pub fn stop(&self) {
        with_state(&self.agent, |st| st.stop_receiver(self.key));
    }

    /// Fires once per established Session.
    pub fn on_connection(&self, f: impl Fn(&ConnectionEvent) + 'static) {
        self.on_connection.set(f);
    }

    /// Decide each request before a Session is created. Runs from `dispatch`;
    /// returning false answers the requester with a decline.
    pub fn set_accept_policy(&self, policy: impl Fn(&IncomingRequest) -> bool + 'static) {
        with_state(&self.agent, |st| {
            if let Some(entry) = st.handshake.receivers.get_mut(&self.key) {
                entry.policy = Some(Rc::new(policy));
            }
        });
    }

    /// Open Sessions, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        with_state(&self.agent, |st| st.receiver_sessions(self.key)).unwrap_or_default()
    }

    /// Collect peer-opened transports from every Session of this Receiver.
    /// Starts listening if idle.
    pub fn listen_transports(&self) -> TransportListener {
        with_state(&self.agent, |st| st.receiver_listener(self.key)).unwrap_or_else(|| {
            let sink = ListenerSink::new(1);
            sink.end(Some(Error::InvalidState("agent dropped")));
            sink.listener()
        })
    }

    /// Outbound transport on the earliest open Session, or on the next one
    /// established.
    pub fn open_transport(&self) -> Transport {
        with_state(&self.agent, |st| st.receiver_open_transport(self.key))
            .unwrap_or_else(|| detached_transport(Error::InvalidState("agent dropped")))
    }
}

/// Application handle for the Requester role.
#[derive(Clone)]
pub struct Request {
    agent: WeakShared,
    key: u64,
    target: String,
}

impl Request {
    /// Nickname of the Receiver this request addresses.
    pub fn nickname(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> RequestState {
        with_state(&self.agent, |st| {
            st.handshake.requests.get(&self.key).map(|r| r.state)
        })
        .flatten()
        .unwrap_or(RequestState::Closed)
    }

    /// Connect. Resolves with the Session, or fails with `PeerUnavailable`,
    /// `HandshakeTimeout` or `Cancelled`.
    pub fn start(&self) -> Pending<Session> {
        with_state(&self.agent, |st| st.start_request(self.key))
            .unwrap_or_else(|| rejected(Error::InvalidState("agent dropped")))
    }

    /// Abandon a pending request; `start()` fails with `Cancelled`.
    pub fn cancel(&self) {
        with_state(&self.agent, |st| st.cancel_request(self.key));
    }

    pub fn session(&self) -> Option<Session> {
        with_state(&self.agent, |st| {
            let sid = st.handshake.requests.get(&self.key)?.session?;
            st.session(sid).map(|s| s.handle(st.self_ref.clone()))
        })
        .flatten()
    }

    /// Collect peer-opened transports of the resulting Session. Starts the
    /// request if idle.
    pub fn listen_transports(&self) -> TransportListener {
        with_state(&self.agent, |st| st.request_listener(self.key)).unwrap_or_else(|| {
            let sink = ListenerSink::new(1);
            sink.end(Some(Error::InvalidState("agent dropped")));
            sink.listener()
        })
    }

    /// Outbound transport over the resulting Session. Starts the request if
    /// idle; `ready` fails with `TransportSetupFailed` if the request fails.
    pub fn open_transport(&self) -> Transport {
        with_state(&self.agent, |st| st.request_open_transport(self.key))
            .unwrap_or_else(|| detached_transport(Error::InvalidState("agent dropped")))
    }
}

fn detached_transport(err: Error) -> Transport {
    let parts = TransportParts::new(1);
    let transport = parts.handle(std::rc::Weak::new(), Direction::Outbound);
    parts.fail(err, &mut Vec::new());
    transport
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testkit::{establish, recorder, Net};
    use crate::transport::TransportState;

    #[test]
    fn both_ends_share_one_established_session() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let (rx, receiver_end, requester_end) = establish(&mut net, a, b, "tv");
        assert_eq!(receiver_end.id(), requester_end.id());
        assert_eq!(receiver_end.role(), Role::Receiver);
        assert_eq!(requester_end.role(), Role::Requester);
        assert_eq!(receiver_end.remote_nickname(), "tv-client");
        assert_eq!(requester_end.remote_nickname(), "tv");
        assert_eq!(receiver_end.state(), crate::SessionState::Established);
        assert_eq!(requester_end.state(), crate::SessionState::Established);
        assert_eq!(rx.state(), ReceiverState::Listening);
        assert_eq!(rx.sessions().len(), 1);
    }

    #[test]
    fn connection_event_carries_each_session() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let c = net.add("c");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        let (seen, record) = recorder();
        rx.on_connection(move |e: &ConnectionEvent| record(e.connection.id()));
        rx.start();
        net.pump();
        let first = net.agent(b).request(RequestOptions::new("tv")).start();
        let second = net.agent(c).request(RequestOptions::new("tv")).start();
        net.pump();
        let first = first.try_result().unwrap().unwrap();
        let second = second.try_result().unwrap().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(*seen.borrow(), vec![first.id(), second.id()]);
    }

    #[test]
    fn unknown_nickname_is_peer_unavailable() {
        let mut net = Net::new();
        let b = net.add("b");
        let pending = net.agent(b).request(RequestOptions::new("ghost")).start();
        assert!(matches!(
            pending.try_result(),
            Some(Err(Error::PeerUnavailable(_)))
        ));
    }

    #[test]
    fn unreachable_endpoint_is_peer_unavailable() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        net.agent(a).receiver(ReceiverOptions::new("tv")).start();
        net.pump();
        net.set_unreachable(a, true);
        let request = net.agent(b).request(RequestOptions::new("tv"));
        let pending = request.start();
        net.pump();
        match pending.try_result() {
            Some(Err(Error::PeerUnavailable(reason))) => assert!(reason.contains("unreachable")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(request.state(), RequestState::Closed);
    }

    #[test]
    fn silent_receiver_times_out() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add_with(
            "b",
            Config {
                handshake_timeout_ticks: 5,
                ..Config::default()
            },
        );
        net.agent(a).receiver(ReceiverOptions::new("tv")).start();
        net.pump();
        net.set_silent(a, true);
        let request = net.agent(b).request(RequestOptions::new("tv"));
        let pending = request.start();
        net.pump();
        net.tick(4);
        assert!(pending.try_result().is_none());
        assert!(net.agent(b).has_pending_requests());
        net.tick(1);
        assert_eq!(pending.try_result(), Some(Err(Error::HandshakeTimeout)));
        assert_eq!(request.state(), RequestState::Closed);
    }

    #[test]
    fn stop_cancels_listening_but_keeps_sessions() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let idle = net.agent(a).receiver(ReceiverOptions::new("radio"));
        let started = idle.start();
        idle.stop();
        assert_eq!(started.try_result().map(|r| r.err()), Some(Some(Error::Cancelled)));
        assert_eq!(idle.state(), ReceiverState::Stopped);

        let (rx, receiver_end, requester_end) = establish(&mut net, a, b, "tv");
        rx.stop();
        net.pump();
        assert_eq!(receiver_end.state(), crate::SessionState::Established);
        assert_eq!(requester_end.state(), crate::SessionState::Established);
        let late = net.agent(b).request(RequestOptions::new("tv")).start();
        assert!(matches!(late.try_result(), Some(Err(Error::PeerUnavailable(_)))));
    }

    #[test]
    fn second_start_while_pending_is_invalid() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        net.agent(a).receiver(ReceiverOptions::new("tv")).start();
        net.pump();
        let request = net.agent(b).request(RequestOptions::new("tv"));
        let first = request.start();
        let second = request.start();
        assert!(matches!(second.try_result(), Some(Err(Error::InvalidState(_)))));
        net.pump();
        assert!(matches!(first.try_result(), Some(Ok(_))));
        assert_eq!(request.state(), RequestState::Established);
    }

    #[test]
    fn accept_policy_declines() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        let (asked, record) = recorder();
        rx.set_accept_policy(move |req: &IncomingRequest| {
            record(req.from.clone());
            req.from != "mallory"
        });
        rx.start();
        net.pump();
        let pending = net
            .agent(b)
            .request(RequestOptions {
                nickname: "tv".into(),
                local_nickname: Some("mallory".into()),
            })
            .start();
        net.pump();
        assert_eq!(
            pending.try_result().map(|r| r.err()),
            Some(Some(Error::PeerUnavailable("request declined".into())))
        );
        assert_eq!(*asked.borrow(), vec!["mallory".to_string()]);
        assert!(rx.sessions().is_empty());
    }

    #[test]
    fn max_sessions_refuses_as_busy() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let c = net.add("c");
        let rx = net.agent(a).receiver(ReceiverOptions {
            nickname: "tv".into(),
            max_sessions: Some(1),
        });
        rx.start();
        net.pump();
        let first = net.agent(b).request(RequestOptions::new("tv")).start();
        net.pump();
        let second = net.agent(c).request(RequestOptions::new("tv")).start();
        net.pump();
        assert!(matches!(first.try_result(), Some(Ok(_))));
        assert_eq!(
            second.try_result().map(|r| r.err()),
            Some(Some(Error::PeerUnavailable("receiver busy".into())))
        );
    }

    #[test]
    fn request_cancel_rejects_start() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        net.agent(a).receiver(ReceiverOptions::new("tv")).start();
        net.pump();
        net.set_silent(a, true);
        let request = net.agent(b).request(RequestOptions::new("tv"));
        let pending = request.start();
        net.pump();
        request.cancel();
        assert_eq!(pending.try_result().map(|r| r.err()), Some(Some(Error::Cancelled)));
        assert!(!net.agent(b).has_pending_requests());
    }

    #[test]
    fn restart_after_session_close() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        net.agent(a).receiver(ReceiverOptions::new("tv")).start();
        net.pump();
        let request = net.agent(b).request(RequestOptions::new("tv"));
        let first = request.start();
        net.pump();
        let first = first.try_result().unwrap().unwrap();
        first.close();
        net.pump();
        assert_eq!(request.state(), RequestState::Closed);
        let again = request.start();
        net.pump();
        let again = again.try_result().unwrap().unwrap();
        assert_ne!(again.id(), first.id());
        assert_eq!(request.session().map(|s| s.id()), Some(again.id()));
    }

    #[test]
    fn listener_collects_transports_from_receiver_sessions() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        let listener = rx.listen_transports();
        assert_eq!(rx.state(), ReceiverState::Listening);
        assert_eq!(listener.ready().try_result(), Some(Ok(())));
        net.pump();
        let session = net
            .agent(b)
            .request(RequestOptions::new("tv"))
            .start();
        net.pump();
        let session = session.try_result().unwrap().unwrap();
        let outbound = session.open_transport().unwrap();
        net.pump();
        assert_eq!(outbound.ready().try_result(), Some(Ok(())));
        let inbound = listener.incoming().try_next().expect("routed to listener");
        assert_eq!(inbound.direction(), Direction::Inbound);
        assert_eq!(inbound.id(), outbound.id());
        assert!(rx.sessions()[0].incoming_transports().is_empty());

        rx.stop();
        assert!(!listener.incoming().is_finished());
        session.close();
        net.pump();
        assert!(listener.incoming().is_finished());
    }

    #[test]
    fn listener_drops_only_the_closed_sessions_transports() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let c = net.add("c");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        let listener = rx.listen_transports();
        net.pump();
        let first = net.agent(b).request(RequestOptions::new("tv")).start();
        let second = net.agent(c).request(RequestOptions::new("tv")).start();
        net.pump();
        let first = first.try_result().unwrap().unwrap();
        let second = second.try_result().unwrap().unwrap();
        first.open_transport().unwrap();
        second.open_transport().unwrap();
        net.pump();
        let incoming = listener.incoming();
        assert_eq!(incoming.len(), 2);

        first.close();
        net.pump();
        assert_eq!(incoming.len(), 1);
        let survivor = incoming.try_next().expect("other session's transport kept");
        assert_eq!(survivor.session_id(), Some(second.id()));
        assert_eq!(survivor.state(), TransportState::Ready);
        assert!(!incoming.is_finished());
    }

    #[test]
    fn request_transport_starts_the_request() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        rx.start();
        net.pump();
        let request = net.agent(b).request(RequestOptions::new("tv"));
        let transport = request.open_transport();
        assert_eq!(request.state(), RequestState::Pending);
        assert_eq!(transport.state(), crate::TransportState::Connecting);
        assert_eq!(
            transport.create_bidirectional_stream().unwrap_err(),
            Error::TransportNotReady
        );
        net.pump();
        assert_eq!(transport.ready().try_result(), Some(Ok(())));
        assert_eq!(transport.session_id(), request.session().map(|s| s.id()));
        assert_eq!(rx.sessions()[0].incoming_transports().len(), 1);
    }

    #[test]
    fn request_transport_fails_setup_when_request_fails() {
        let mut net = Net::new();
        let b = net.add("b");
        let request = net.agent(b).request(RequestOptions::new("ghost"));
        let listener = request.listen_transports();
        let transport = request.open_transport();
        net.pump();
        assert!(matches!(
            transport.ready().try_result(),
            Some(Err(Error::TransportSetupFailed(_)))
        ));
        assert_eq!(transport.state(), crate::TransportState::Closed);
        assert!(matches!(
            listener.ready().try_result(),
            Some(Err(Error::PeerUnavailable(_)))
        ));
        assert!(listener.incoming().is_finished());
    }

    #[test]
    fn receiver_transport_waits_for_first_session() {
        let mut net = Net::new();
        let a = net.add("a");
        let b = net.add("b");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        let early = rx.open_transport();
        assert_eq!(rx.state(), ReceiverState::Listening);
        assert_eq!(early.id(), None);
        let cancelled = rx.open_transport();
        cancelled.close(1, "changed my mind");
        assert_eq!(cancelled.state(), crate::TransportState::Closed);
        net.pump();
        let session = net.agent(b).request(RequestOptions::new("tv")).start();
        net.pump();
        let session = session.try_result().unwrap().unwrap();
        assert_eq!(early.session_id(), Some(session.id()));
        assert_eq!(early.ready().try_result(), Some(Ok(())));
        assert_eq!(session.incoming_transports().len(), 1);
        assert_eq!(
            cancelled.closed().try_result(),
            Some(Ok(CloseInfo {
                code: 1,
                reason: "changed my mind".into()
            }))
        );
    }

    #[test]
    fn stopping_receiver_fails_parked_transports() {
        let mut net = Net::new();
        let a = net.add("a");
        let rx = net.agent(a).receiver(ReceiverOptions::new("tv"));
        rx.start();
        let parked = rx.open_transport();
        rx.stop();
        net.pump();
        assert!(matches!(
            parked.ready().try_result(),
            Some(Err(Error::TransportSetupFailed(_)))
        ));
    }
}
