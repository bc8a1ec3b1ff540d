//! The agent: one host-driven protocol core.
//!
//! Performs no I/O. The host feeds it dial results, accepted connections,
//! received frames, connection loss and periodic ticks; it drains
//! [`OutboundAction`]s with [`Agent::poll_actions`] and runs queued callbacks
//! with [`Agent::dispatch`]. Everything lives on one thread; application
//! handles hold weak references back to the agent state.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use crate::config::Config;
use crate::error::{Error, MessageError};
use crate::event::{EventDispatcher, Handler, Job};
use crate::handshake::{HandshakeCoordinator, IncomingRequest, Receiver, ReceiverOptions, Request, RequestOptions};
use crate::protocol::Message;
use crate::rendezvous::{PeerEndpoint, Rendezvous};
use crate::session::{SessionEntry, SessionId};
use crate::wire::{FrameCodec, FrameEncodeError};

pub(crate) type WeakShared = Weak<RefCell<AgentState>>;

/// Host-assigned id of a raw connection from the secure transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Core-assigned id of an outstanding dial; echoed back in [`Agent::on_dial_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DialId(pub u64);

/// What the host must do on the core's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Start announcing this nickname on the rendezvous.
    Advertise { nickname: String },
    /// Stop announcing it.
    Withdraw { nickname: String },
    /// Open a raw connection; report with `on_dial_result`.
    Dial { dial: DialId, endpoint: PeerEndpoint },
    /// Write one length-prefixed frame.
    SendFrame { connection: ConnectionId, frame: Vec<u8> },
    /// Close the raw connection after flushing earlier frames.
    Close { connection: ConnectionId },
}

/// Deferred state transition. Runs from `dispatch`, after every job queued before it.
pub(crate) enum Task {
    AcceptChannel {
        session: SessionId,
        channel: u64,
    },
    AcceptTransport {
        session: SessionId,
        transport: u64,
    },
    ResolveRequest {
        receiver: u64,
        connection: ConnectionId,
        request_id: u64,
        request: IncomingRequest,
    },
}

/// What a raw connection is currently for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    /// Accepted; waiting for a ConnectRequest.
    Inbound,
    /// ConnectRequest received; the Receiver's decision is queued.
    Deciding,
    /// Dialed for a Request; waiting for accept or reject.
    Requesting(u64),
    Session(SessionId),
}

pub(crate) struct Outgoing {
    action: OutboundAction,
    /// Channel bytes to release from `buffered_amount` once the host takes the frame.
    accounted: Option<(SessionId, u64, usize)>,
}

/// Side effects collected while one Session is borrowed: frames for its
/// connection and jobs for the dispatcher.
pub(crate) struct Effects {
    pub(crate) agent: WeakShared,
    pub(crate) session: SessionId,
    codec: FrameCodec,
    pub(crate) frames: Vec<(Message, Option<(u64, usize)>)>,
    pub(crate) jobs: Vec<Job>,
}

impl Effects {
    pub(crate) fn new(agent: WeakShared, session: SessionId, codec: FrameCodec) -> Self {
        Self {
            agent,
            session,
            codec,
            frames: Vec::new(),
            jobs: Vec::new(),
        }
    }

    /// Refuse an application payload whose frame would exceed the limit,
    /// before anything about it is queued.
    pub(crate) fn check_frame(&self, msg: &Message) -> Result<(), Error> {
        match self.codec.body_len(msg) {
            Ok(_) => Ok(()),
            Err(FrameEncodeError::TooLarge { len, limit }) => Err(Error::MessageTooLarge { len, limit }),
            Err(FrameEncodeError::Encode(err)) => {
                tracing::error!(session = %self.session, %err, "message cannot be encoded");
                Err(Error::InvalidState("message cannot be encoded"))
            }
        }
    }

    pub(crate) fn send(&mut self, msg: Message) {
        self.frames.push((msg, None));
    }

    pub(crate) fn send_channel_data(&mut self, channel: u64, len: usize, msg: Message) {
        self.frames.push((msg, Some((channel, len))));
    }

    pub(crate) fn deliver<E: 'static>(&mut self, handler: &Handler<E>, event: E) {
        self.jobs.push(Job::deliver(handler, event));
    }

    pub(crate) fn unsubscribe<E: 'static>(&mut self, handler: &Handler<E>) {
        self.jobs.push(Job::unsubscribe(handler));
    }

    pub(crate) fn task(&mut self, task: Task) {
        self.jobs.push(Job::Task(task));
    }
}

/// Run `f` against the agent state behind a handle. None if the agent is gone
/// or already borrowed (a callback re-entering from inside the core).
pub(crate) fn with_state<R>(agent: &WeakShared, f: impl FnOnce(&mut AgentState) -> R) -> Option<R> {
    let shared = agent.upgrade()?;
    let mut state = match shared.try_borrow_mut() {
        Ok(state) => state,
        Err(_) => {
            tracing::error!("agent re-entered while busy");
            return None;
        }
    };
    Some(f(&mut state))
}

pub(crate) struct AgentState {
    pub(crate) self_ref: WeakShared,
    pub(crate) config: Config,
    pub(crate) rendezvous: Box<dyn Rendezvous>,
    pub(crate) dispatcher: EventDispatcher,
    outbox: VecDeque<Outgoing>,
    pub(crate) ticks: u64,
    pub(crate) next_dial: u64,
    pub(crate) connections: HashMap<ConnectionId, Link>,
    pub(crate) handshake: HandshakeCoordinator,
    pub(crate) sessions: HashMap<SessionId, SessionEntry>,
}

impl AgentState {
    pub(crate) fn push_action(&mut self, action: OutboundAction) {
        self.outbox.push_back(Outgoing {
            action,
            accounted: None,
        });
    }

    pub(crate) fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.max_frame_len)
    }

    /// Application payloads were sized by `Effects::check_frame`; only a
    /// control frame can still fail here.
    fn push_frame(&mut self, connection: ConnectionId, msg: &Message, accounted: Option<(SessionId, u64, usize)>) {
        match self.codec().encode(msg) {
            Ok(frame) => {
                self.outbox.push_back(Outgoing {
                    action: OutboundAction::SendFrame { connection, frame },
                    accounted,
                });
            }
            Err(err) => {
                tracing::error!(?connection, %err, "frame encode failed, dropped");
                self.release_accounted(accounted);
            }
        }
    }

    pub(crate) fn send_to(&mut self, connection: ConnectionId, msg: &Message) {
        self.push_frame(connection, msg, None);
    }

    fn release_accounted(&mut self, accounted: Option<(SessionId, u64, usize)>) {
        if let Some((sid, channel, len)) = accounted {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.mux.drained(channel, len);
            }
        }
    }

    pub(crate) fn session(&self, sid: SessionId) -> Option<&SessionEntry> {
        self.sessions.get(&sid)
    }

    pub(crate) fn session_mut(&mut self, sid: SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(&sid)
    }

    /// Run `f` on one Session, then flush what it produced. None if the Session is gone.
    pub(crate) fn with_effects<R>(
        &mut self,
        sid: SessionId,
        f: impl FnOnce(&mut SessionEntry, &mut Effects) -> R,
    ) -> Option<R> {
        let mut fx = Effects::new(self.self_ref.clone(), sid, self.codec());
        let session = self.sessions.get_mut(&sid)?;
        let result = f(session, &mut fx);
        let connection = session.connection;
        self.apply(connection, fx);
        Some(result)
    }

    fn apply(&mut self, connection: ConnectionId, fx: Effects) {
        let sid = fx.session;
        for (msg, accounted) in fx.frames {
            let accounted = accounted.map(|(channel, len)| (sid, channel, len));
            self.push_frame(connection, &msg, accounted);
        }
        self.dispatcher.extend(fx.jobs);
    }

    /// Tear a Session down. `remote` is true when the peer or the connection ended it.
    pub(crate) fn close_session(&mut self, sid: SessionId, remote: bool) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        if !remote {
            self.send_to(session.connection, &Message::SessionClose);
            self.push_action(OutboundAction::Close {
                connection: session.connection,
            });
        }
        self.connections.remove(&session.connection);
        let mut fx = Effects::new(self.self_ref.clone(), sid, self.codec());
        session.mux.abort_all(&mut fx);
        session.transports.abort_all(&mut fx);
        let handle = session.handle(self.self_ref.clone());
        fx.deliver(
            &session.handlers.on_close,
            crate::event::SessionCloseEvent {
                session: handle,
                remote,
            },
        );
        fx.unsubscribe(&session.handlers.on_close);
        fx.unsubscribe(&session.handlers.on_datachannel);
        self.dispatcher.extend(fx.jobs);
        tracing::info!(session = %sid, remote, "session closed");
        self.session_ended(session.source, sid);
    }

    fn on_frame(&mut self, connection: ConnectionId, bytes: &[u8]) -> Result<(), MessageError> {
        let link = *self
            .connections
            .get(&connection)
            .ok_or(MessageError::UnknownConnection)?;
        let (msg, _) = self.codec().decode(bytes).map_err(|err| {
            tracing::warn!(?connection, %err, "undecodable frame");
            MessageError::DecodeFailed
        })?;
        match (link, msg) {
            (Link::Inbound, Message::ConnectRequest { request_id, from, to }) => {
                self.on_connect_request(connection, request_id, from, to);
            }
            (Link::Requesting(key), Message::ConnectAccept { request_id, session_id }) => {
                self.on_connect_accept(connection, key, request_id, session_id);
            }
            (Link::Requesting(key), Message::ConnectReject { reason, .. }) => {
                self.on_connect_reject(connection, key, reason);
            }
            (Link::Session(sid), Message::SessionClose) => self.close_session(sid, true),
            (Link::Session(sid), msg) => {
                self.with_effects(sid, |s, fx| s.on_message(msg, fx));
            }
            (_, Message::Announce { .. }) => {
                tracing::debug!(?connection, "announce on a connection ignored");
            }
            (link, msg) => {
                tracing::warn!(?connection, ?link, ?msg, "message out of place, ignored");
            }
        }
        Ok(())
    }

    fn on_connection_closed(&mut self, connection: ConnectionId) {
        match self.connections.remove(&connection) {
            Some(Link::Session(sid)) => self.close_session(sid, true),
            Some(Link::Requesting(key)) => self.on_request_connection_lost(key),
            Some(link) => tracing::debug!(?connection, ?link, "connection closed before handshake"),
            None => {}
        }
    }

    fn poll_actions(&mut self) -> Vec<OutboundAction> {
        let drained: Vec<Outgoing> = self.outbox.drain(..).collect();
        drained
            .into_iter()
            .map(|out| {
                self.release_accounted(out.accounted);
                out.action
            })
            .collect()
    }
}

/// Host-facing handle to the core. Not `Send`: keep it on one thread and
/// funnel work from other threads through a command queue.
pub struct Agent {
    state: Rc<RefCell<AgentState>>,
}

impl Agent {
    pub fn new(config: Config, rendezvous: impl Rendezvous + 'static) -> Self {
        let state = Rc::new_cyclic(|self_ref| {
            RefCell::new(AgentState {
                self_ref: self_ref.clone(),
                config,
                rendezvous: Box::new(rendezvous),
                dispatcher: EventDispatcher::default(),
                outbox: VecDeque::new(),
                ticks: 0,
                next_dial: 1,
                connections: HashMap::new(),
                handshake: HandshakeCoordinator::default(),
                sessions: HashMap::new(),
            })
        });
        Self { state }
    }

    pub fn config(&self) -> Config {
        self.state.borrow().config.clone()
    }

    /// A Receiver for `options.nickname`. Idle until `start()`.
    pub fn receiver(&self, options: ReceiverOptions) -> Receiver {
        self.state.borrow_mut().new_receiver(options)
    }

    /// A Request addressing `options.nickname`. Idle until `start()`.
    pub fn request(&self, options: RequestOptions) -> Request {
        self.state.borrow_mut().new_request(options)
    }

    /// Outcome of an `OutboundAction::Dial`.
    pub fn on_dial_result(&self, dial: DialId, result: Result<ConnectionId, Error>) {
        self.state.borrow_mut().on_dial_result(dial, result);
    }

    /// A peer connected to us; it should send a ConnectRequest next.
    pub fn on_connection_accepted(&self, connection: ConnectionId) {
        tracing::debug!(?connection, "inbound connection");
        self.state
            .borrow_mut()
            .connections
            .insert(connection, Link::Inbound);
    }

    /// One complete frame, as produced by [`FrameCodec::encode`] on the peer.
    pub fn on_frame(&self, connection: ConnectionId, frame: &[u8]) -> Result<(), MessageError> {
        self.state.borrow_mut().on_frame(connection, frame)
    }

    /// The raw connection is gone. Its Session (if any) closes as remote.
    pub fn on_connection_closed(&self, connection: ConnectionId) {
        self.state.borrow_mut().on_connection_closed(connection);
    }

    /// Advance the handshake clock by one tick.
    pub fn tick(&self) {
        let mut state = self.state.borrow_mut();
        state.ticks += 1;
        state.expire_requests();
    }

    /// Run queued callbacks and deferred transitions until the queue is empty.
    /// Callbacks run with no borrow held and may call back into any handle.
    /// Returns the number of jobs run.
    pub fn dispatch(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.state.borrow_mut().dispatcher.pop();
            let Some(job) = job else {
                break;
            };
            ran += 1;
            match job {
                Job::Deliver(deliver) => deliver(),
                Job::Task(task) => self.run_task(task),
            }
        }
        ran
    }

    fn run_task(&self, task: Task) {
        match task {
            Task::AcceptChannel { session, channel } => {
                self.state
                    .borrow_mut()
                    .with_effects(session, |s, fx| s.mux.accept_open(channel, fx));
            }
            Task::AcceptTransport { session, transport } => {
                self.state
                    .borrow_mut()
                    .with_effects(session, |s, fx| s.transports.accept_inbound(transport, fx));
            }
            Task::ResolveRequest {
                receiver,
                connection,
                request_id,
                request,
            } => {
                // the policy is application code: call it with no borrow held
                let policy = self.state.borrow().handshake.policy(receiver);
                let accepted = policy.map_or(true, |policy| policy(&request));
                self.state
                    .borrow_mut()
                    .resolve_request(receiver, connection, request_id, request, accepted);
            }
        }
    }

    /// Take everything the host must do, in order.
    pub fn poll_actions(&self) -> Vec<OutboundAction> {
        self.state.borrow_mut().poll_actions()
    }

    /// True if callbacks are queued or actions wait for the host.
    pub fn has_pending_work(&self) -> bool {
        let state = self.state.borrow();
        state.dispatcher.len() > 0 || !state.outbox.is_empty()
    }

    /// True while any Request is waiting for an answer (the host should keep ticking).
    pub fn has_pending_requests(&self) -> bool {
        self.state.borrow().handshake.has_pending_requests()
    }

    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }
}
