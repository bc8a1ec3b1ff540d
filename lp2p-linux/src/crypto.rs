//! Agent keys and per-connection sealing for the TCP engine.
//!
//! Each agent has one X25519 keypair for its lifetime; its announced
//! [`AgentId`] is the first half of the SHA-256 of the public key, so a peer
//! can check the two belong together. A connection's session key comes from
//! the Diffie-Hellman secret and the optional PSK, and every frame is sealed
//! with ChaCha20-Poly1305 under a nonce made of the sending side and that
//! side's frame counter.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use lp2p_core::AgentId;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as DhPublic, StaticSecret};

const KEY_LABEL: &[u8] = b"lp2p-session-v1";

/// X25519 public key as sent in the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The agent id this key announces itself under.
    pub fn agent_id(&self) -> AgentId {
        let digest = Sha256::digest(self.0);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        AgentId::from_bytes(id)
    }
}

pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(DhPublic::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn agent_id(&self) -> AgentId {
        self.public.agent_id()
    }

    /// Key for a connection to `peer`. Both ends get the same key only if
    /// they hold the same PSK (or neither has one).
    pub fn session_key(&self, peer: &PublicKey, psk: Option<&[u8]>) -> SessionKey {
        let shared = self.secret.diffie_hellman(&DhPublic::from(peer.0));
        let mut hasher = Sha256::new();
        hasher.update(KEY_LABEL);
        hasher.update(shared.as_bytes());
        if let Some(psk) = psk {
            hasher.update((psk.len() as u64).to_le_bytes());
            hasher.update(psk);
        }
        SessionKey(hasher.finalize().into())
    }
}

/// Which end of the TCP connection sealed a frame. Dialer and listener count
/// frames independently, so the side keeps their nonces apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Dialer,
    Listener,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Dialer => Side::Listener,
            Side::Listener => Side::Dialer,
        }
    }

    fn nonce(self, counter: u64) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[0] = match self {
            Side::Dialer => 0,
            Side::Listener => 1,
        };
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        Nonce::from(nonce)
    }
}

/// Symmetric key of one connection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Seal frame number `counter` sent by `side`. A counter must never be
    /// reused for the same side.
    pub fn seal(&self, side: Side, counter: u64, plain: &[u8]) -> Result<Vec<u8>, SealError> {
        self.cipher()
            .encrypt(&side.nonce(counter), plain)
            .map_err(|_| SealError::Seal)
    }

    pub fn open(&self, side: Side, counter: u64, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        self.cipher()
            .decrypt(&side.nonce(counter), sealed)
            .map_err(|_| SealError::Open)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("frame could not be sealed")]
    Seal,
    #[error("frame failed authentication")]
    Open,
}
