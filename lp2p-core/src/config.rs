//! Core configuration. Hosts build one per agent.

use crate::event::DEFAULT_EVENT_BUFFER_LIMIT;
use crate::incoming::DEFAULT_INCOMING_TRANSPORT_CAPACITY;
use crate::wire::MAX_FRAME_LEN;

/// Default handshake timeout in ticks.
pub const DEFAULT_HANDSHAKE_TIMEOUT_TICKS: u64 = 30;

/// Tunables for one [`crate::Agent`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Ticks a Requester waits for an accept before failing with `HandshakeTimeout`.
    pub handshake_timeout_ticks: u64,
    /// Inbound transports buffered per queue before the peer gets `TransportQueueFull`.
    pub incoming_transport_capacity: usize,
    /// Events a handler slot holds while no callback is assigned.
    pub event_buffer_limit: usize,
    /// Largest frame accepted from a peer.
    pub max_frame_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout_ticks: DEFAULT_HANDSHAKE_TIMEOUT_TICKS,
            incoming_transport_capacity: DEFAULT_INCOMING_TRANSPORT_CAPACITY,
            event_buffer_limit: DEFAULT_EVENT_BUFFER_LIMIT,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}
