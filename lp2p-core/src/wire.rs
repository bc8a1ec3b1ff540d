//! Frame codec. A frame is a 4-byte little-endian body length followed by the
//! bincode encoding of one [`Message`]. The body length is bounded by the
//! codec's limit in both directions, so a sender learns about an oversized
//! message before it is queued and a receiver never buffers one.

use crate::protocol::Message;

/// Bytes in the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Default body limit: 16 MiB.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encoder and decoder for one body size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    limit: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Size of `msg`'s body, or `TooLarge` if it would not fit in a frame.
    pub fn body_len(&self, msg: &Message) -> Result<usize, FrameEncodeError> {
        let len = bincode::serialized_size(msg)?;
        if len > u64::from(self.limit) {
            return Err(FrameEncodeError::TooLarge {
                len,
                limit: self.limit,
            });
        }
        Ok(len as usize)
    }

    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
        let len = self.body_len(msg)?;
        let mut out = Vec::with_capacity(LEN_PREFIX + len);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        bincode::serialize_into(&mut out, msg)?;
        Ok(out)
    }

    /// Decode the frame at the front of `bytes`; returns it with the bytes consumed.
    /// `NeedMore` means the frame is incomplete and the caller should read on.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
        let len = self.declared_len(bytes)?;
        let end = LEN_PREFIX + len;
        let body = bytes.get(LEN_PREFIX..end).ok_or(FrameDecodeError::NeedMore)?;
        let msg = bincode::deserialize(body)?;
        Ok((msg, end))
    }

    /// Body length announced by the prefix, checked before any body byte is read.
    fn declared_len(&self, bytes: &[u8]) -> Result<usize, FrameDecodeError> {
        let mut prefix = [0u8; LEN_PREFIX];
        match bytes.get(..LEN_PREFIX) {
            Some(head) => prefix.copy_from_slice(head),
            None => return Err(FrameDecodeError::NeedMore),
        }
        let len = u32::from_le_bytes(prefix);
        if len > self.limit {
            return Err(FrameDecodeError::TooLarge {
                len,
                limit: self.limit,
            });
        }
        Ok(len as usize)
    }
}

/// Encode with the default limit.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    FrameCodec::default().encode(msg)
}

/// Decode with the default limit.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    FrameCodec::default().decode(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame body of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: u64, limit: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("declared frame body of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: u32, limit: u32 },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
