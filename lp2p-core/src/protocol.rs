//! LP2P wire protocol: message types and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Used in announcements.
pub const PROTOCOL_VERSION: u8 = 1;

/// Stable 16-byte id an agent announces itself under. How it is derived is
/// up to the host's secure transport.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AgentId([u8; 16]);

impl AgentId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        AgentId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// How a channel payload was produced by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataEncoding {
    Binary,
    String,
}

/// Kind of a stream inside a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Bidirectional,
    Unidirectional,
}

/// Why a connect request was turned down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// No Receiver is listening under the addressed nickname.
    NoReceiver,
    /// The Receiver's accept policy declined the request.
    Declined,
    /// The Receiver already holds its maximum number of sessions.
    Busy,
    /// The Receiver was stopped before the request was decided.
    Stopped,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RejectReason::NoReceiver => "no receiver listening",
            RejectReason::Declined => "request declined",
            RejectReason::Busy => "receiver busy",
            RejectReason::Stopped => "receiver stopped",
        })
    }
}

/// Why an inbound transport was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportRejectReason {
    QueueFull,
    SessionClosing,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Rendezvous: advertise nicknames reachable at `listen_port`.
    Announce {
        protocol_version: u8,
        agent_id: AgentId,
        listen_port: u16,
        nicknames: Vec<String>,
    },
    /// Requester asks the Receiver advertised as `to` for a session.
    ConnectRequest {
        request_id: u64,
        from: String,
        to: String,
    },
    /// Receiver accepted; both ends now share `session_id`.
    ConnectAccept {
        request_id: u64,
        session_id: [u8; 16],
    },
    ConnectReject {
        request_id: u64,
        reason: RejectReason,
    },
    ChannelOpen {
        id: u64,
        label: String,
        protocol: String,
    },
    ChannelOpenAck {
        id: u64,
    },
    /// The requested id collides with a channel the peer already holds.
    ChannelOpenReject {
        id: u64,
    },
    ChannelData {
        id: u64,
        encoding: DataEncoding,
        payload: Vec<u8>,
    },
    /// Sender will send nothing more on this channel.
    ChannelClosing {
        id: u64,
    },
    /// Acknowledges `ChannelClosing`; the channel is gone on both ends.
    ChannelClosed {
        id: u64,
    },
    TransportOpen {
        id: u64,
    },
    TransportAccept {
        id: u64,
    },
    TransportReject {
        id: u64,
        reason: TransportRejectReason,
    },
    TransportClose {
        id: u64,
        code: u32,
        reason: String,
    },
    StreamOpen {
        transport: u64,
        stream: u64,
        kind: StreamKind,
    },
    StreamData {
        transport: u64,
        stream: u64,
        payload: Vec<u8>,
        fin: bool,
    },
    Datagram {
        transport: u64,
        payload: Vec<u8>,
    },
    /// The sender tore the session down.
    SessionClose,
}
