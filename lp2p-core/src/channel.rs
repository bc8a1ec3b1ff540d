//! Channel multiplexer: message-oriented data channels inside a Session.
//!
//! Ids come from disjoint ranges per role (Receiver even, Requester odd) unless
//! the application supplies one. An id is never reused within a Session, even
//! after its channel is Closed.

use std::collections::BTreeMap;

use crate::agent::{with_state, Effects, WeakShared};
use crate::error::Error;
use crate::event::{ChannelErrorEvent, ChannelStateEvent, Handler, MessageEvent};
use crate::protocol::{DataEncoding, Message};
use crate::session::{Role, SessionId};

/// Lifecycle of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// How binary messages are presented to the application. Stored and reported; the
/// payload bytes are identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryType {
    #[default]
    Blob,
    ArrayBuffer,
}

/// A channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_wire(self) -> (DataEncoding, Vec<u8>) {
        match self {
            Payload::Text(s) => (DataEncoding::String, s.into_bytes()),
            Payload::Binary(b) => (DataEncoding::Binary, b),
        }
    }

    fn from_wire(encoding: DataEncoding, payload: Vec<u8>) -> Self {
        match encoding {
            DataEncoding::String => match String::from_utf8(payload) {
                Ok(s) => Payload::Text(s),
                Err(e) => Payload::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
            DataEncoding::Binary => Payload::Binary(payload),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(b)
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Binary(b.to_vec())
    }
}

/// Options for `create_data_channel`.
#[derive(Debug, Clone, Default)]
pub struct DataChannelInit {
    pub protocol: String,
    /// Explicit id; fails with `ChannelIdInUse` if already taken in the Session.
    pub id: Option<u64>,
}

#[derive(Clone)]
pub(crate) struct ChannelHandlers {
    pub(crate) on_open: Handler<ChannelStateEvent>,
    pub(crate) on_message: Handler<MessageEvent>,
    pub(crate) on_closing: Handler<ChannelStateEvent>,
    pub(crate) on_close: Handler<ChannelStateEvent>,
    pub(crate) on_error: Handler<ChannelErrorEvent>,
}

impl ChannelHandlers {
    fn new(limit: usize) -> Self {
        Self {
            on_open: Handler::new(limit),
            on_message: Handler::new(limit),
            on_closing: Handler::new(limit),
            on_close: Handler::new(limit),
            on_error: Handler::new(limit),
        }
    }
}

pub(crate) struct ChannelEntry {
    label: String,
    protocol: String,
    state: ChannelState,
    binary_type: BinaryType,
    buffered_amount: usize,
    locally_initiated: bool,
    handlers: ChannelHandlers,
}

/// Creates, ids and tracks the channels of one Session.
pub(crate) struct ChannelMultiplexer {
    next_id: u64,
    channels: BTreeMap<u64, ChannelEntry>,
    event_buffer_limit: usize,
}

impl ChannelMultiplexer {
    pub(crate) fn new(role: Role, event_buffer_limit: usize) -> Self {
        let next_id = match role {
            Role::Receiver => 0,
            Role::Requester => 1,
        };
        Self {
            next_id,
            channels: BTreeMap::new(),
            event_buffer_limit,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        while self.channels.contains_key(&self.next_id) {
            self.next_id += 2;
        }
        let id = self.next_id;
        self.next_id += 2;
        id
    }

    pub(crate) fn ids(&self) -> Vec<u64> {
        self.channels.keys().copied().collect()
    }

    pub(crate) fn state(&self, id: u64) -> Option<ChannelState> {
        self.channels.get(&id).map(|c| c.state)
    }

    fn handle(&self, fx: &Effects, id: u64) -> Option<DataChannel> {
        self.channels
            .get(&id)
            .map(|c| DataChannel::new(fx.agent.clone(), fx.session, id, c))
    }

    /// Local `createDataChannel`: the channel starts Connecting and opens once the peer acks.
    pub(crate) fn create(
        &mut self,
        label: &str,
        init: DataChannelInit,
        fx: &mut Effects,
    ) -> Result<DataChannel, Error> {
        let id = match init.id {
            Some(id) if self.channels.contains_key(&id) => return Err(Error::ChannelIdInUse(id)),
            Some(id) => id,
            None => self.allocate_id(),
        };
        self.channels.insert(
            id,
            ChannelEntry {
                label: label.to_string(),
                protocol: init.protocol.clone(),
                state: ChannelState::Connecting,
                binary_type: BinaryType::default(),
                buffered_amount: 0,
                locally_initiated: true,
                handlers: ChannelHandlers::new(self.event_buffer_limit),
            },
        );
        fx.send(Message::ChannelOpen {
            id,
            label: label.to_string(),
            protocol: init.protocol,
        });
        tracing::debug!(session = %fx.session, channel = id, label, "channel connecting");
        self.handle(fx, id)
            .ok_or(Error::InvalidState("channel vanished during create"))
    }

    /// Peer asked for a channel. Returns the new (Connecting) channel, or None
    /// when the id collides and the request was refused. The caller announces it
    /// and schedules `accept_open`.
    pub(crate) fn on_open_request(
        &mut self,
        id: u64,
        label: String,
        protocol: String,
        fx: &mut Effects,
    ) -> Option<DataChannel> {
        if self.channels.contains_key(&id) {
            tracing::warn!(session = %fx.session, channel = id, "peer opened channel with id in use");
            fx.send(Message::ChannelOpenReject { id });
            return None;
        }
        self.channels.insert(
            id,
            ChannelEntry {
                label,
                protocol,
                state: ChannelState::Connecting,
                binary_type: BinaryType::default(),
                buffered_amount: 0,
                locally_initiated: false,
                handlers: ChannelHandlers::new(self.event_buffer_limit),
            },
        );
        self.handle(fx, id)
    }

    /// Deferred half of a peer-initiated open: runs after the `datachannel` event.
    pub(crate) fn accept_open(&mut self, id: u64, fx: &mut Effects) {
        if self.state(id) != Some(ChannelState::Connecting) {
            return;
        }
        fx.send(Message::ChannelOpenAck { id });
        self.transition(id, ChannelState::Open, fx);
    }

    pub(crate) fn on_open_ack(&mut self, id: u64, fx: &mut Effects) {
        match self.channels.get(&id) {
            Some(c) if c.locally_initiated && c.state == ChannelState::Connecting => {
                self.transition(id, ChannelState::Open, fx);
            }
            _ => tracing::debug!(session = %fx.session, channel = id, "stray channel ack"),
        }
    }

    pub(crate) fn on_open_reject(&mut self, id: u64, fx: &mut Effects) {
        if self.state(id) != Some(ChannelState::Connecting) {
            return;
        }
        if let Some(channel) = self.handle(fx, id) {
            let handler = self.channels[&id].handlers.on_error.clone();
            fx.deliver(
                &handler,
                ChannelErrorEvent {
                    channel,
                    error: Error::ChannelIdInUse(id),
                },
            );
        }
        self.transition(id, ChannelState::Closed, fx);
    }

    /// Enqueue a message. Only an Open channel accepts sends, and only
    /// messages whose frame fits the limit.
    pub(crate) fn send(&mut self, id: u64, payload: Payload, fx: &mut Effects) -> Result<(), Error> {
        let channel = self.channels.get_mut(&id).ok_or(Error::ChannelNotOpen)?;
        if channel.state != ChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }
        let len = payload.len();
        let (encoding, payload) = payload.into_wire();
        let msg = Message::ChannelData {
            id,
            encoding,
            payload,
        };
        fx.check_frame(&msg)?;
        channel.buffered_amount += len;
        fx.send_channel_data(id, len, msg);
        Ok(())
    }

    pub(crate) fn on_data(
        &mut self,
        id: u64,
        encoding: DataEncoding,
        payload: Vec<u8>,
        fx: &mut Effects,
    ) {
        let Some(channel) = self.channels.get(&id) else {
            tracing::warn!(session = %fx.session, channel = id, "data for unknown channel");
            return;
        };
        match channel.state {
            ChannelState::Open | ChannelState::Closing => {
                let handler = channel.handlers.on_message.clone();
                fx.deliver(
                    &handler,
                    MessageEvent {
                        data: Payload::from_wire(encoding, payload),
                    },
                );
            }
            state => {
                tracing::warn!(session = %fx.session, channel = id, ?state, "data on channel that is not open");
            }
        }
    }

    /// Local `close()`. Open goes through Closing and waits for the peer's ack;
    /// a still-Connecting channel is cancelled straight to Closed.
    pub(crate) fn close(&mut self, id: u64, fx: &mut Effects) {
        match self.state(id) {
            Some(ChannelState::Open) => {
                fx.send(Message::ChannelClosing { id });
                self.transition(id, ChannelState::Closing, fx);
            }
            Some(ChannelState::Connecting) => {
                fx.send(Message::ChannelClosing { id });
                self.transition(id, ChannelState::Closed, fx);
            }
            _ => {}
        }
    }

    /// Peer is closing: everything it sent before this has already been delivered.
    pub(crate) fn on_closing(&mut self, id: u64, fx: &mut Effects) {
        match self.state(id) {
            Some(ChannelState::Open) => {
                fx.send(Message::ChannelClosed { id });
                self.transition(id, ChannelState::Closing, fx);
                self.transition(id, ChannelState::Closed, fx);
            }
            Some(ChannelState::Connecting) | Some(ChannelState::Closing) => {
                fx.send(Message::ChannelClosed { id });
                self.transition(id, ChannelState::Closed, fx);
            }
            _ => {}
        }
    }

    pub(crate) fn on_closed(&mut self, id: u64, fx: &mut Effects) {
        if self.state(id) == Some(ChannelState::Closing) {
            self.transition(id, ChannelState::Closed, fx);
        }
    }

    /// Session teardown: every live channel goes directly to Closed.
    pub(crate) fn abort_all(&mut self, fx: &mut Effects) {
        let live: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.state != ChannelState::Closed)
            .map(|(&id, _)| id)
            .collect();
        for id in live {
            self.transition(id, ChannelState::Closed, fx);
        }
    }

    pub(crate) fn binary_type(&self, id: u64) -> Option<BinaryType> {
        self.channels.get(&id).map(|c| c.binary_type)
    }

    pub(crate) fn set_binary_type(&mut self, id: u64, binary_type: BinaryType) {
        if let Some(c) = self.channels.get_mut(&id) {
            c.binary_type = binary_type;
        }
    }

    pub(crate) fn buffered_amount(&self, id: u64) -> usize {
        self.channels.get(&id).map_or(0, |c| c.buffered_amount)
    }

    /// The host drained `len` bytes of this channel's data from the outbox.
    pub(crate) fn drained(&mut self, id: u64, len: usize) {
        if let Some(c) = self.channels.get_mut(&id) {
            c.buffered_amount = c.buffered_amount.saturating_sub(len);
        }
    }

    fn transition(&mut self, id: u64, to: ChannelState, fx: &mut Effects) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        if entry.state == to || entry.state == ChannelState::Closed {
            return;
        }
        tracing::debug!(session = %fx.session, channel = id, from = ?entry.state, ?to, "channel state");
        entry.state = to;
        if to == ChannelState::Closed {
            entry.buffered_amount = 0;
        }
        let handlers = entry.handlers.clone();
        let channel = DataChannel::new(fx.agent.clone(), fx.session, id, entry);
        let event = ChannelStateEvent { channel, state: to };
        match to {
            ChannelState::Open => fx.deliver(&handlers.on_open, event),
            ChannelState::Closing => fx.deliver(&handlers.on_closing, event),
            ChannelState::Closed => {
                fx.deliver(&handlers.on_close, event);
                fx.unsubscribe(&handlers.on_open);
                fx.unsubscribe(&handlers.on_message);
                fx.unsubscribe(&handlers.on_closing);
                fx.unsubscribe(&handlers.on_close);
                fx.unsubscribe(&handlers.on_error);
            }
            ChannelState::Connecting => {}
        }
    }
}

/// Application handle to a data channel.
#[derive(Clone)]
pub struct DataChannel {
    agent: WeakShared,
    session: SessionId,
    id: u64,
    label: String,
    protocol: String,
    handlers: ChannelHandlers,
}

impl DataChannel {
    fn new(agent: WeakShared, session: SessionId, id: u64, entry: &ChannelEntry) -> Self {
        Self {
            agent,
            session,
            id,
            label: entry.label.clone(),
            protocol: entry.protocol.clone(),
            handlers: entry.handlers.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Current state; Closed once the owning Session is gone.
    pub fn state(&self) -> ChannelState {
        with_state(&self.agent, |st| {
            st.session(self.session).and_then(|s| s.mux.state(self.id))
        })
        .flatten()
        .unwrap_or(ChannelState::Closed)
    }

    pub fn binary_type(&self) -> BinaryType {
        with_state(&self.agent, |st| {
            st.session(self.session)
                .and_then(|s| s.mux.binary_type(self.id))
        })
        .flatten()
        .unwrap_or_default()
    }

    pub fn set_binary_type(&self, binary_type: BinaryType) {
        with_state(&self.agent, |st| {
            if let Some(s) = st.session_mut(self.session) {
                s.mux.set_binary_type(self.id, binary_type);
            }
        });
    }

    /// Bytes handed to `send` that the host has not drained yet.
    pub fn buffered_amount(&self) -> usize {
        with_state(&self.agent, |st| {
            st.session(self.session)
                .map_or(0, |s| s.mux.buffered_amount(self.id))
        })
        .unwrap_or(0)
    }

    /// Send a message. Fails with `ChannelNotOpen` unless the channel is Open,
    /// and with `MessageTooLarge` if its frame would exceed `max_frame_len`.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), Error> {
        let payload = payload.into();
        with_state(&self.agent, |st| {
            st.with_effects(self.session, |s, fx| s.mux.send(self.id, payload, fx))
                .unwrap_or(Err(Error::ChannelNotOpen))
        })
        .unwrap_or(Err(Error::ChannelNotOpen))
    }

    /// Begin closing. A no-op once Closing or Closed.
    pub fn close(&self) {
        with_state(&self.agent, |st| {
            st.with_effects(self.session, |s, fx| s.mux.close(self.id, fx));
        });
    }

    pub fn on_open(&self, f: impl Fn(&ChannelStateEvent) + 'static) {
        self.handlers.on_open.set(f);
    }

    pub fn on_message(&self, f: impl Fn(&MessageEvent) + 'static) {
        self.handlers.on_message.set(f);
    }

    pub fn on_closing(&self, f: impl Fn(&ChannelStateEvent) + 'static) {
        self.handlers.on_closing.set(f);
    }

    pub fn on_close(&self, f: impl Fn(&ChannelStateEvent) + 'static) {
        self.handlers.on_close.set(f);
    }

    pub fn on_error(&self, f: impl Fn(&ChannelErrorEvent) + 'static) {
        self.handlers.on_error.set(f);
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("session", &self.session)
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Effects;
    use crate::wire::FrameCodec;
    use std::rc::Weak;

    fn fx() -> Effects {
        Effects::new(Weak::new(), SessionId::from_bytes([9; 16]), FrameCodec::default())
    }

    fn frames(fx: &Effects) -> Vec<&Message> {
        fx.frames.iter().map(|(m, _)| m).collect()
    }

    #[test]
    fn role_ranges_never_collide() {
        let mut receiver = ChannelMultiplexer::new(Role::Receiver, 8);
        let mut requester = ChannelMultiplexer::new(Role::Requester, 8);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let a = receiver.create("a", DataChannelInit::default(), &mut fx()).unwrap();
            let b = requester.create("b", DataChannelInit::default(), &mut fx()).unwrap();
            assert_eq!(a.id() % 2, 0);
            assert_eq!(b.id() % 2, 1);
            assert!(seen.insert(a.id()));
            assert!(seen.insert(b.id()));
        }
    }

    #[test]
    fn explicit_id_in_use_fails_and_auto_skips_it() {
        let mut mux = ChannelMultiplexer::new(Role::Receiver, 8);
        let init = DataChannelInit {
            id: Some(2),
            ..Default::default()
        };
        mux.create("x", init.clone(), &mut fx()).unwrap();
        assert_eq!(
            mux.create("y", init, &mut fx()).unwrap_err(),
            Error::ChannelIdInUse(2)
        );
        let first = mux.create("a", DataChannelInit::default(), &mut fx()).unwrap();
        let second = mux.create("b", DataChannelInit::default(), &mut fx()).unwrap();
        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 4);
    }

    #[test]
    fn closed_id_is_not_reused() {
        let mut mux = ChannelMultiplexer::new(Role::Requester, 8);
        let mut f = fx();
        let ch = mux.create("a", DataChannelInit::default(), &mut f).unwrap();
        mux.close(ch.id(), &mut f);
        assert_eq!(mux.state(ch.id()), Some(ChannelState::Closed));
        let init = DataChannelInit {
            id: Some(ch.id()),
            ..Default::default()
        };
        assert!(matches!(
            mux.create("again", init, &mut f),
            Err(Error::ChannelIdInUse(_))
        ));
    }

    #[test]
    fn send_requires_open() {
        let mut mux = ChannelMultiplexer::new(Role::Requester, 8);
        let mut f = fx();
        let ch = mux.create("a", DataChannelInit::default(), &mut f).unwrap();
        assert_eq!(
            mux.send(ch.id(), "early".into(), &mut f),
            Err(Error::ChannelNotOpen)
        );
        mux.on_open_ack(ch.id(), &mut f);
        assert_eq!(mux.state(ch.id()), Some(ChannelState::Open));
        mux.send(ch.id(), "hi".into(), &mut f).unwrap();
        assert_eq!(mux.buffered_amount(ch.id()), 2);
        mux.drained(ch.id(), 2);
        assert_eq!(mux.buffered_amount(ch.id()), 0);
    }

    #[test]
    fn colliding_remote_open_is_rejected() {
        let mut mux = ChannelMultiplexer::new(Role::Receiver, 8);
        let mut f = fx();
        let ch = mux.create("mine", DataChannelInit::default(), &mut f).unwrap();
        let mut f = fx();
        assert!(mux
            .on_open_request(ch.id(), "theirs".into(), String::new(), &mut f)
            .is_none());
        assert!(matches!(
            frames(&f)[..],
            [Message::ChannelOpenReject { id }] if *id == ch.id()
        ));
    }

    #[test]
    fn close_handshake_passes_through_closing() {
        let mut mux = ChannelMultiplexer::new(Role::Requester, 8);
        let mut f = fx();
        let ch = mux.create("a", DataChannelInit::default(), &mut f).unwrap();
        mux.on_open_ack(ch.id(), &mut f);
        mux.close(ch.id(), &mut f);
        assert_eq!(mux.state(ch.id()), Some(ChannelState::Closing));
        mux.close(ch.id(), &mut f);
        mux.on_closed(ch.id(), &mut f);
        assert_eq!(mux.state(ch.id()), Some(ChannelState::Closed));
        let closings = frames(&f)
            .into_iter()
            .filter(|m| matches!(m, Message::ChannelClosing { .. }))
            .count();
        assert_eq!(closings, 1);
    }

    #[test]
    fn peer_closing_is_acknowledged() {
        let mut mux = ChannelMultiplexer::new(Role::Receiver, 8);
        let mut f = fx();
        mux.on_open_request(1, "chat".into(), String::new(), &mut f)
            .unwrap();
        mux.accept_open(1, &mut f);
        let mut f = fx();
        mux.on_closing(1, &mut f);
        assert_eq!(mux.state(1), Some(ChannelState::Closed));
        assert!(matches!(frames(&f)[..], [Message::ChannelClosed { id: 1 }]));
    }

    #[test]
    fn text_payload_survives_wire_encoding() {
        let (enc, bytes) = Payload::from("héllo").into_wire();
        assert_eq!(enc, DataEncoding::String);
        assert_eq!(Payload::from_wire(enc, bytes), Payload::Text("héllo".into()));
    }
}
