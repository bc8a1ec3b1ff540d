//! Session: the established pairing of a Receiver and a Requester over one
//! connection. Owns the channel multiplexer and transport manager.

use std::fmt;

use crate::agent::{with_state, ConnectionId, Effects, Task, WeakShared};
use crate::channel::{ChannelMultiplexer, DataChannel, DataChannelInit};
use crate::config::Config;
use crate::error::Error;
use crate::event::{DataChannelEvent, Handler, SessionCloseEvent};
use crate::incoming::IncomingQueue;
use crate::protocol::Message;
use crate::transport::{CloseInfo, Transport, TransportManager};

/// Session identifier, shared by both ends (UUID v4 chosen by the Receiver).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub(crate) fn random() -> Self {
        SessionId(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Requester,
}

/// Sessions only exist once the handshake finished; before that the
/// Receiver or Request carries the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Closed,
}

/// What produced a Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Receiver(u64),
    Request(u64),
}

#[derive(Clone)]
pub(crate) struct SessionHandlers {
    pub(crate) on_datachannel: Handler<DataChannelEvent>,
    pub(crate) on_close: Handler<SessionCloseEvent>,
}

pub(crate) struct SessionEntry {
    pub(crate) id: SessionId,
    pub(crate) role: Role,
    pub(crate) local_nickname: String,
    pub(crate) remote_nickname: String,
    pub(crate) connection: ConnectionId,
    pub(crate) source: Source,
    pub(crate) mux: ChannelMultiplexer,
    pub(crate) transports: TransportManager,
    pub(crate) handlers: SessionHandlers,
}

impl SessionEntry {
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        local_nickname: String,
        remote_nickname: String,
        connection: ConnectionId,
        source: Source,
        config: &Config,
    ) -> Self {
        let limit = config.event_buffer_limit;
        Self {
            id,
            role,
            local_nickname,
            remote_nickname,
            connection,
            source,
            mux: ChannelMultiplexer::new(role, limit),
            transports: TransportManager::new(role, config.incoming_transport_capacity, limit),
            handlers: SessionHandlers {
                on_datachannel: Handler::new(limit),
                on_close: Handler::new(limit),
            },
        }
    }

    pub(crate) fn handle(&self, agent: WeakShared) -> Session {
        Session {
            agent,
            id: self.id,
            role: self.role,
            local_nickname: self.local_nickname.clone(),
            remote_nickname: self.remote_nickname.clone(),
            incoming: self.transports.incoming(),
            handlers: self.handlers.clone(),
        }
    }

    /// Route one in-session message. Handshake messages and `SessionClose` are
    /// handled by the agent before this.
    pub(crate) fn on_message(&mut self, msg: Message, fx: &mut Effects) {
        match msg {
            Message::ChannelOpen { id, label, protocol } => {
                if let Some(channel) = self.mux.on_open_request(id, label, protocol, fx) {
                    fx.deliver(&self.handlers.on_datachannel, DataChannelEvent { channel });
                    fx.task(Task::AcceptChannel {
                        session: self.id,
                        channel: id,
                    });
                }
            }
            Message::ChannelOpenAck { id } => self.mux.on_open_ack(id, fx),
            Message::ChannelOpenReject { id } => self.mux.on_open_reject(id, fx),
            Message::ChannelData {
                id,
                encoding,
                payload,
            } => self.mux.on_data(id, encoding, payload, fx),
            Message::ChannelClosing { id } => self.mux.on_closing(id, fx),
            Message::ChannelClosed { id } => self.mux.on_closed(id, fx),
            Message::TransportOpen { id } => self.transports.on_open(id, fx),
            Message::TransportAccept { id } => self.transports.on_accept(id, fx),
            Message::TransportReject { id, reason } => self.transports.on_reject(id, reason, fx),
            Message::TransportClose { id, code, reason } => {
                self.transports.on_close(id, CloseInfo { code, reason }, fx)
            }
            Message::StreamOpen {
                transport,
                stream,
                kind,
            } => self.transports.on_stream_open(transport, stream, kind, fx),
            Message::StreamData {
                transport,
                stream,
                payload,
                fin,
            } => self
                .transports
                .on_stream_data(transport, stream, payload, fin, fx),
            Message::Datagram { transport, payload } => {
                self.transports.on_datagram(transport, payload, fx)
            }
            other => {
                tracing::warn!(session = %self.id, msg = ?other, "unexpected message in session");
            }
        }
    }
}

/// Application handle to a Session. Cheap to clone; every clone refers to
/// the same Session.
#[derive(Clone)]
pub struct Session {
    agent: WeakShared,
    id: SessionId,
    role: Role,
    local_nickname: String,
    remote_nickname: String,
    incoming: IncomingQueue<Transport>,
    handlers: SessionHandlers,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_nickname(&self) -> &str {
        &self.local_nickname
    }

    pub fn remote_nickname(&self) -> &str {
        &self.remote_nickname
    }

    pub fn state(&self) -> SessionState {
        match with_state(&self.agent, |st| st.session(self.id).is_some()) {
            Some(true) => SessionState::Established,
            _ => SessionState::Closed,
        }
    }

    /// Create a channel. It starts Connecting; `open` fires once the peer acks.
    pub fn create_data_channel(&self, label: &str, init: DataChannelInit) -> Result<DataChannel, Error> {
        with_state(&self.agent, |st| {
            st.with_effects(self.id, |s, fx| s.mux.create(label, init, fx))
        })
        .flatten()
        .unwrap_or(Err(Error::SessionClosed))
    }

    /// Ids of every channel ever created in this Session, closed ones included.
    pub fn channel_ids(&self) -> Vec<u64> {
        with_state(&self.agent, |st| st.session(self.id).map(|s| s.mux.ids()))
            .flatten()
            .unwrap_or_default()
    }

    pub fn transport_ids(&self) -> Vec<u64> {
        with_state(&self.agent, |st| st.session(self.id).map(|s| s.transports.ids()))
            .flatten()
            .unwrap_or_default()
    }

    /// Open a transport over this Session; await `ready()` before opening streams.
    pub fn open_transport(&self) -> Result<Transport, Error> {
        with_state(&self.agent, |st| {
            st.with_effects(self.id, |s, fx| s.transports.open(fx))
        })
        .flatten()
        .ok_or(Error::SessionClosed)
    }

    /// Peer-opened transports, each yielded once. Ends when the Session closes.
    /// Empty if a transport listener claimed this Session's transports.
    pub fn incoming_transports(&self) -> IncomingQueue<Transport> {
        self.incoming.clone()
    }

    pub fn on_datachannel(&self, f: impl Fn(&DataChannelEvent) + 'static) {
        self.handlers.on_datachannel.set(f);
    }

    pub fn on_close(&self, f: impl Fn(&SessionCloseEvent) + 'static) {
        self.handlers.on_close.set(f);
    }

    /// Tear the Session down: every channel goes straight to Closed and every
    /// transport fails with `SessionClosed`. A no-op once Closed.
    pub fn close(&self) {
        with_state(&self.agent, |st| st.close_session(self.id, false));
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.role == other.role
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local", &self.local_nickname)
            .field("remote", &self.remote_nickname)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_displays_as_uuid() {
        let id = SessionId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "abababab-abab-abab-abab-abababababab");
        assert_ne!(SessionId::random(), SessionId::random());
    }
}
