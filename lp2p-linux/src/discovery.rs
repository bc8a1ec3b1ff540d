//! LAN rendezvous: UDP multicast announce beacons carrying advertised nicknames,
//! and the directory the core resolves nicknames against.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lp2p_core::wire::{decode_frame, encode_frame};
use lp2p_core::{AgentId, Error, Message, PeerEndpoint, Rendezvous, PROTOCOL_VERSION};
use tokio::net::UdpSocket;

const MULTICAST_GROUP: &str = "239.255.60.61";
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const PEER_TIMEOUT: Duration = Duration::from_secs(8);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Nicknames this agent currently advertises. Written by the host loop on
/// `Advertise`/`Withdraw`, read by the beacon loop.
#[derive(Clone, Default)]
pub struct Advertised(Arc<Mutex<BTreeSet<String>>>);

impl Advertised {
    pub fn insert(&self, nickname: &str) {
        lock(&self.0).insert(nickname.to_string());
    }

    pub fn remove(&self, nickname: &str) {
        lock(&self.0).remove(nickname);
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.0).iter().cloned().collect()
    }
}

struct PeerState {
    addr: SocketAddr,
    nicknames: Vec<String>,
    last_seen: Instant,
}

/// Peers heard on the LAN, keyed by agent id.
#[derive(Clone, Default)]
pub struct Directory {
    peers: Arc<Mutex<HashMap<AgentId, PeerState>>>,
}

impl Directory {
    /// Record a beacon. Returns true the first time a peer is heard.
    pub fn observe(&self, agent: AgentId, addr: SocketAddr, nicknames: Vec<String>, now: Instant) -> bool {
        let mut peers = lock(&self.peers);
        let is_new = !peers.contains_key(&agent);
        peers.insert(
            agent,
            PeerState {
                addr,
                nicknames,
                last_seen: now,
            },
        );
        is_new
    }

    /// Drop peers not heard from within the timeout. Returns how many left.
    pub fn expire(&self, now: Instant) -> usize {
        let mut peers = lock(&self.peers);
        let before = peers.len();
        peers.retain(|_, s| now.duration_since(s.last_seen) < PEER_TIMEOUT);
        before - peers.len()
    }
}

impl Rendezvous for Directory {
    fn resolve(&self, nickname: &str) -> Result<Vec<PeerEndpoint>, Error> {
        let peers = lock(&self.peers);
        let mut found: Vec<(Instant, PeerEndpoint)> = peers
            .values()
            .filter(|s| s.nicknames.iter().any(|n| n == nickname))
            .map(|s| {
                (
                    s.last_seen,
                    PeerEndpoint {
                        nickname: nickname.to_string(),
                        address: s.addr.to_string(),
                    },
                )
            })
            .collect();
        if found.is_empty() {
            return Err(Error::PeerUnavailable(nickname.to_string()));
        }
        // most recently heard first
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, e)| e).collect())
    }
}

pub async fn run_discovery(
    agent_id: AgentId,
    discovery_port: u16,
    transport_port: u16,
    advertised: Advertised,
    directory: Directory,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);

    let send_socket = socket.clone();
    let beacon_task = tokio::spawn(async move {
        beacon_loop(send_socket, agent_id, discovery_port, transport_port, advertised).await
    });
    let recv_dir = directory.clone();
    let recv_task = tokio::spawn(async move { recv_loop(socket, agent_id, recv_dir).await });
    let timeout_task = tokio::spawn(async move { peer_timeout_loop(directory).await });

    let (beacon, recv, _) = tokio::try_join!(beacon_task, recv_task, timeout_task)?;
    beacon?;
    recv?;
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr = MULTICAST_GROUP
        .parse()
        .map_err(|e: std::net::AddrParseError| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn announce_frame(agent_id: AgentId, transport_port: u16, nicknames: Vec<String>) -> std::io::Result<Vec<u8>> {
    encode_frame(&Message::Announce {
        protocol_version: PROTOCOL_VERSION,
        agent_id,
        listen_port: transport_port,
        nicknames,
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    agent_id: AgentId,
    discovery_port: u16,
    transport_port: u16,
    advertised: Advertised,
) -> std::io::Result<()> {
    let dest: SocketAddr = format!("{}:{}", MULTICAST_GROUP, discovery_port)
        .parse()
        .map_err(|e: std::net::AddrParseError| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    loop {
        let nicknames = advertised.snapshot();
        // silent agents still announce so peers learn the address
        let frame = announce_frame(agent_id, transport_port, nicknames)?;
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::warn!(%e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

/// Parse one datagram. None for foreign versions, our own beacons and noise.
fn parse_announce(buf: &[u8], me: AgentId, from: SocketAddr) -> Option<(AgentId, SocketAddr, Vec<String>)> {
    let (msg, _) = decode_frame(buf).ok()?;
    match msg {
        Message::Announce {
            protocol_version,
            agent_id,
            listen_port,
            nicknames,
        } if protocol_version == PROTOCOL_VERSION && agent_id != me => {
            Some((agent_id, SocketAddr::new(from.ip(), listen_port), nicknames))
        }
        _ => None,
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, me: AgentId, directory: Directory) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if let Some((agent, addr, nicknames)) = parse_announce(&buf[..n], me, from) {
            if directory.observe(agent, addr, nicknames, Instant::now()) {
                tracing::info!(%addr, "peer discovered");
            }
        }
    }
}

async fn peer_timeout_loop(directory: Directory) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let gone = directory.expire(Instant::now());
        if gone > 0 {
            tracing::info!(gone, "peers timed out");
        }
    }
}
