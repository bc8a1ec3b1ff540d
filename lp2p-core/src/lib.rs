//! LP2P session negotiation and multiplexing core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod agent;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod handshake;
pub mod incoming;
pub mod pending;
pub mod protocol;
pub mod rendezvous;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testkit;

pub use agent::{Agent, ConnectionId, DialId, OutboundAction};
pub use channel::{BinaryType, ChannelState, DataChannel, DataChannelInit, Payload};
pub use config::Config;
pub use error::{Error, MessageError};
pub use event::{
    ChannelErrorEvent, ChannelStateEvent, ConnectionEvent, DataChannelEvent, DatagramEvent, Handler,
    MessageEvent, SessionCloseEvent, StreamDataEvent, TransportCloseEvent,
};
pub use handshake::{
    IncomingRequest, Receiver, ReceiverOptions, ReceiverState, Request, RequestOptions, RequestState,
    TransportListener,
};
pub use incoming::IncomingQueue;
pub use pending::Pending;
pub use protocol::{AgentId, Message, PROTOCOL_VERSION};
pub use rendezvous::{MemoryRendezvous, PeerEndpoint, Rendezvous};
pub use session::{Role, Session, SessionId, SessionState};
pub use transport::{CloseInfo, Direction, Transport, TransportState, TransportStream};
pub use wire::{decode_frame, encode_frame, FrameCodec, FrameDecodeError, FrameEncodeError};
