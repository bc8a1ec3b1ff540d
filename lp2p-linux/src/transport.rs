//! Secure transport engine: TCP server (incoming), TCP client (dials the core
//! asks for), X25519 handshake, then sealed length-prefixed frames.
//!
//! Every connection reports to the host loop through one event channel; the
//! host writes to it through a per-connection command channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lp2p_core::{AgentId, ConnectionId, DialId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::crypto::{Keypair, PublicKey, SessionKey, Side};

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + agent_id + public_key
const LEN_SIZE: usize = 4;
/// Largest sealed frame: a full core frame plus the AEAD tag.
const MAX_SEALED_LEN: usize = lp2p_core::wire::MAX_FRAME_LEN as usize + LEN_SIZE + 16;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// What a connection tells the host loop.
#[derive(Debug)]
pub enum NetEvent {
    Accepted {
        connection: ConnectionId,
        writer: mpsc::UnboundedSender<WriterCmd>,
    },
    Dialed {
        dial: DialId,
        result: Result<(ConnectionId, mpsc::UnboundedSender<WriterCmd>), String>,
    },
    Frame {
        connection: ConnectionId,
        frame: Vec<u8>,
    },
    Closed {
        connection: ConnectionId,
    },
}

#[derive(Debug)]
pub enum WriterCmd {
    Frame(Vec<u8>),
    /// Flush what came before, then shut the socket down.
    Close,
}

/// Keys and counters shared by every connection this agent makes.
#[derive(Clone)]
pub struct Engine {
    keypair: Arc<Keypair>,
    psk: Option<Arc<[u8]>>,
    next_connection: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<NetEvent>,
}

impl Engine {
    pub fn new(keypair: Arc<Keypair>, psk: Option<Vec<u8>>, events: mpsc::UnboundedSender<NetEvent>) -> Self {
        Self {
            keypair,
            psk: psk.map(Arc::from),
            next_connection: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Accept loop. Each accepted socket is handshaken and served on its own task.
    pub async fn listen(self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, "transport listening");
        loop {
            let (stream, from) = listener.accept().await?;
            let engine = self.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                match handshake(&mut stream, &engine.keypair, engine.psk.as_deref(), Side::Listener).await {
                    Ok((peer, key)) => {
                        let connection = engine.allocate();
                        tracing::debug!(?connection, %from, ?peer, "inbound connection");
                        let (writer, reader) = engine.split(stream, key, Side::Listener);
                        if engine.events.send(NetEvent::Accepted { connection, writer }).is_err() {
                            return;
                        }
                        engine.spawn_reader(reader, key, Side::Listener, connection);
                    }
                    Err(e) => tracing::warn!(%from, %e, "inbound handshake failed"),
                }
            });
        }
    }

    /// Dial `address` for the core. The outcome always comes back as `Dialed`.
    pub fn dial(&self, dial: DialId, address: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.connect(&address).await {
                Ok((stream, key)) => {
                    let connection = engine.allocate();
                    let (writer, reader) = engine.split(stream, key, Side::Dialer);
                    let result = Ok((connection, writer));
                    if engine.events.send(NetEvent::Dialed { dial, result }).is_ok() {
                        engine.spawn_reader(reader, key, Side::Dialer, connection);
                    }
                }
                Err(e) => {
                    tracing::warn!(%address, %e, "dial failed");
                    let result = Err(format!("{address}: {e}"));
                    let _ = engine.events.send(NetEvent::Dialed { dial, result });
                }
            }
        });
    }

    async fn connect(&self, address: &str) -> std::io::Result<(TcpStream, SessionKey)> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e: std::net::AddrParseError| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        let (_, key) = handshake(&mut stream, &self.keypair, self.psk.as_deref(), Side::Dialer).await?;
        Ok((stream, key))
    }

    /// Start the writer task; the read half is returned so the caller can
    /// report the connection before any of its frames.
    fn split(
        &self,
        stream: TcpStream,
        key: SessionKey,
        local: Side,
    ) -> (mpsc::UnboundedSender<WriterCmd>, OwnedReadHalf) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, key, local, rx));
        (tx, reader)
    }

    fn spawn_reader(&self, reader: OwnedReadHalf, key: SessionKey, local: Side, connection: ConnectionId) {
        let events = self.events.clone();
        let remote = local.peer();
        tokio::spawn(async move {
            if let Err(e) = read_loop(reader, key, remote, connection, &events).await {
                tracing::debug!(?connection, %e, "connection ended");
            }
            let _ = events.send(NetEvent::Closed { connection });
        });
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    key: SessionKey,
    remote: Side,
    connection: ConnectionId,
    events: &mpsc::UnboundedSender<NetEvent>,
) -> std::io::Result<()> {
    let mut counter: u64 = 0;
    loop {
        let frame = read_sealed(&mut reader, &key, remote, counter).await?;
        counter = counter.saturating_add(1);
        if events.send(NetEvent::Frame { connection, frame }).is_err() {
            return Ok(());
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    key: SessionKey,
    local: Side,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) {
    let mut counter: u64 = 0;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(plain) => {
                if let Err(e) = write_sealed(&mut writer, &key, local, counter, &plain).await {
                    tracing::debug!(%e, "write failed");
                    break;
                }
                counter = counter.saturating_add(1);
            }
            WriterCmd::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Exchange version, agent id and public key, then derive the session key.
/// The dialer speaks first.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keypair: &Keypair,
    psk: Option<&[u8]>,
    side: Side,
) -> std::io::Result<(AgentId, SessionKey)> {
    let out = handshake_bytes(keypair);
    let mut buf = [0u8; HANDSHAKE_SIZE];
    match side {
        Side::Dialer => {
            stream.write_all(&out).await?;
            stream.flush().await?;
            stream.read_exact(&mut buf).await?;
        }
        Side::Listener => {
            stream.read_exact(&mut buf).await?;
            stream.write_all(&out).await?;
            stream.flush().await?;
        }
    }
    let (peer_id, peer_public) = parse_handshake(&buf)?;
    Ok((peer_id, keypair.session_key(&peer_public, psk)))
}

fn handshake_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.agent_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> std::io::Result<(AgentId, PublicKey)> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut agent_id = [0u8; 16];
    agent_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let public = PublicKey::from_bytes(public_key);
    if public.agent_id() != AgentId::from_bytes(agent_id) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "agent id does not match public key",
        ));
    }
    Ok((AgentId::from_bytes(agent_id), public))
}

pub async fn write_sealed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &SessionKey,
    side: Side,
    counter: u64,
    plain: &[u8],
) -> std::io::Result<()> {
    let cipher = key
        .seal(side, counter, plain)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(cipher.len() as u32).to_le_bytes()).await?;
    writer.write_all(&cipher).await?;
    writer.flush().await
}

pub async fn read_sealed<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &SessionKey,
    side: Side,
    counter: u64,
) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_SEALED_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "sealed frame too large"));
    }
    let mut cipher = vec![0u8; len];
    reader.read_exact(&mut cipher).await?;
    key.open(side, counter, &cipher)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paired_keys(psk_a: Option<&[u8]>, psk_b: Option<&[u8]>) -> (SessionKey, SessionKey, AgentId, AgentId) {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let (mut left, mut right) = tokio::io::duplex(1024);
        let (dialer, listener) = tokio::join!(
            handshake(&mut left, &a, psk_a, Side::Dialer),
            handshake(&mut right, &b, psk_b, Side::Listener),
        );
        let (seen_by_a, key_a) = dialer.unwrap();
        let (seen_by_b, key_b) = listener.unwrap();
        assert_eq!(seen_by_a, b.agent_id());
        assert_eq!(seen_by_b, a.agent_id());
        (key_a, key_b, seen_by_a, seen_by_b)
    }

    #[tokio::test]
    async fn handshake_agrees_on_key() {
        let (key_a, key_b, _, _) = paired_keys(Some(b"1234"), Some(b"1234")).await;
        assert!(key_a == key_b);
    }

    #[tokio::test]
    async fn mismatched_psk_cannot_open_frames() {
        let (key_a, key_b, _, _) = paired_keys(Some(b"1234"), Some(b"9999")).await;
        let (mut left, mut right) = tokio::io::duplex(1024);
        write_sealed(&mut left, &key_a, Side::Dialer, 0, b"hello").await.unwrap();
        assert!(read_sealed(&mut right, &key_b, Side::Dialer, 0).await.is_err());
    }

    #[tokio::test]
    async fn sealed_frames_keep_order() {
        let (key, _, _, _) = paired_keys(None, None).await;
        let (mut left, mut right) = tokio::io::duplex(4096);
        for (i, msg) in [b"one".as_slice(), b"two", b"three"].iter().enumerate() {
            write_sealed(&mut left, &key, Side::Listener, i as u64, msg).await.unwrap();
        }
        let mut got = Vec::new();
        for i in 0..3 {
            got.push(read_sealed(&mut right, &key, Side::Listener, i).await.unwrap());
        }
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn wrong_version_is_refused() {
        let b = Keypair::generate();
        let (mut left, mut right) = tokio::io::duplex(1024);
        let mut bogus = handshake_bytes(&Keypair::generate());
        bogus[0] = PROTOCOL_VERSION + 1;
        left.write_all(&bogus).await.unwrap();
        let err = handshake(&mut right, &b, None, Side::Listener).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
