//! Error taxonomy shared by every component of the core.

/// Failure of a handshake, channel, or transport operation.
///
/// Every variant is scoped to one Session, Channel, or Transport. `Clone` so a
/// shared future can hand the same failure to each waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("channel id {0} already in use")]
    ChannelIdInUse(u64),
    #[error("channel is not open")]
    ChannelNotOpen,
    #[error("session closed")]
    SessionClosed,
    #[error("transport setup failed: {0}")]
    TransportSetupFailed(String),
    #[error("transport not ready")]
    TransportNotReady,
    #[error("transport closed")]
    TransportClosed,
    #[error("incoming transport queue full")]
    TransportQueueFull,
    #[error("message of {len} bytes exceeds the {limit}-byte frame limit")]
    MessageTooLarge { len: u64, limit: u32 },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Error processing a received frame.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message")]
    DecodeFailed,
    #[error("unknown connection")]
    UnknownConnection,
}
