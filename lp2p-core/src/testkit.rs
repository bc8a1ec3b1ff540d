//! Loopback harness: agents wired through one in-memory rendezvous, with every
//! outbound action delivered to the addressed peer until the network is quiet.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::agent::{Agent, ConnectionId, OutboundAction};
use crate::config::Config;
use crate::error::{Error, MessageError};
use crate::handshake::{Receiver, ReceiverOptions, RequestOptions};
use crate::protocol::Message;
use crate::rendezvous::MemoryRendezvous;
use crate::session::Session;
use crate::wire;

struct Node {
    name: String,
    agent: Agent,
    unreachable: bool,
    silent: bool,
}

pub(crate) struct Net {
    pub(crate) rendezvous: MemoryRendezvous,
    nodes: Vec<Node>,
    links: HashMap<(usize, ConnectionId), (usize, ConnectionId)>,
    next_connection: u64,
    /// Every frame delivered, as (sender, message).
    pub(crate) log: Vec<(usize, Message)>,
}

impl Net {
    pub(crate) fn new() -> Self {
        Self {
            rendezvous: MemoryRendezvous::new(),
            nodes: Vec::new(),
            links: HashMap::new(),
            next_connection: 1,
            log: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, name: &str) -> usize {
        self.add_with(name, Config::default())
    }

    pub(crate) fn add_with(&mut self, name: &str, config: Config) -> usize {
        self.nodes.push(Node {
            name: name.to_string(),
            agent: Agent::new(config, self.rendezvous.clone()),
            unreachable: false,
            silent: false,
        });
        self.nodes.len() - 1
    }

    pub(crate) fn agent(&self, node: usize) -> &Agent {
        &self.nodes[node].agent
    }

    /// Dials to this node fail.
    pub(crate) fn set_unreachable(&mut self, node: usize, unreachable: bool) {
        self.nodes[node].unreachable = unreachable;
    }

    /// Connections to this node succeed but frames to it vanish.
    pub(crate) fn set_silent(&mut self, node: usize, silent: bool) {
        self.nodes[node].silent = silent;
    }

    /// Drop every raw connection of `node` without a goodbye.
    pub(crate) fn cut(&mut self, node: usize) {
        let ends: Vec<_> = self
            .links
            .keys()
            .filter(|(n, _)| *n == node)
            .copied()
            .collect();
        for end in ends {
            if let Some(peer) = self.links.remove(&end) {
                self.links.remove(&peer);
                self.nodes[end.0].agent.on_connection_closed(end.1);
                self.nodes[peer.0].agent.on_connection_closed(peer.1);
            }
        }
    }

    pub(crate) fn frames_from(&self, node: usize) -> impl Iterator<Item = &Message> {
        self.log
            .iter()
            .filter(move |(n, _)| *n == node)
            .map(|(_, m)| m)
    }

    /// Dispatch and deliver until no agent has anything left to do.
    pub(crate) fn pump(&mut self) {
        for _ in 0..10_000 {
            let mut busy = false;
            for node in 0..self.nodes.len() {
                if self.nodes[node].agent.dispatch() > 0 {
                    busy = true;
                }
                let actions = self.nodes[node].agent.poll_actions();
                busy |= !actions.is_empty();
                for action in actions {
                    self.deliver(node, action);
                }
            }
            if !busy {
                return;
            }
        }
        panic!("loopback network did not settle");
    }

    /// Tick every agent `n` times, pumping after each tick.
    pub(crate) fn tick(&mut self, n: usize) {
        for _ in 0..n {
            for node in &self.nodes {
                node.agent.tick();
            }
            self.pump();
        }
    }

    fn deliver(&mut self, from: usize, action: OutboundAction) {
        match action {
            OutboundAction::Advertise { nickname } => {
                self.rendezvous.register(&nickname, &self.nodes[from].name);
            }
            OutboundAction::Withdraw { nickname } => {
                self.rendezvous.unregister(&nickname, &self.nodes[from].name);
            }
            OutboundAction::Dial { dial, endpoint } => {
                let target = self
                    .nodes
                    .iter()
                    .position(|n| n.name == endpoint.address && !n.unreachable);
                let Some(target) = target else {
                    self.nodes[from].agent.on_dial_result(
                        dial,
                        Err(Error::TransportSetupFailed(format!("{} unreachable", endpoint.address))),
                    );
                    return;
                };
                let near = ConnectionId(self.next_connection);
                let far = ConnectionId(self.next_connection + 1);
                self.next_connection += 2;
                self.links.insert((from, near), (target, far));
                self.links.insert((target, far), (from, near));
                self.nodes[target].agent.on_connection_accepted(far);
                self.nodes[from].agent.on_dial_result(dial, Ok(near));
            }
            OutboundAction::SendFrame { connection, frame } => {
                let Some(&(peer, peer_connection)) = self.links.get(&(from, connection)) else {
                    return;
                };
                let (msg, _) = wire::decode_frame(&frame).expect("core emitted a bad frame");
                self.log.push((from, msg));
                if self.nodes[peer].silent {
                    return;
                }
                // frames racing a local close land on a forgotten connection
                let result = self.nodes[peer].agent.on_frame(peer_connection, &frame);
                assert!(
                    !matches!(result, Err(MessageError::DecodeFailed)),
                    "peer could not decode a frame"
                );
            }
            OutboundAction::Close { connection } => {
                if let Some(peer) = self.links.remove(&(from, connection)) {
                    self.links.remove(&peer);
                    self.nodes[peer.0].agent.on_connection_closed(peer.1);
                }
            }
        }
    }
}

/// Listen as `nickname` on `receiver`, connect from `requester`, and return
/// the Receiver plus both ends of the resulting Session (receiver end first).
pub(crate) fn establish(
    net: &mut Net,
    receiver: usize,
    requester: usize,
    nickname: &str,
) -> (Receiver, Session, Session) {
    let rx = net.agent(receiver).receiver(ReceiverOptions::new(nickname));
    let started = rx.start();
    net.pump();
    let request = net.agent(requester).request(RequestOptions {
        nickname: nickname.to_string(),
        local_nickname: Some(format!("{nickname}-client")),
    });
    let pending = request.start();
    net.pump();
    let receiver_end = started
        .try_result()
        .expect("receiver settled")
        .expect("receiver accepted");
    let requester_end = pending
        .try_result()
        .expect("request settled")
        .expect("request accepted");
    (rx, receiver_end, requester_end)
}

/// Collects events (or anything derived from them) for later assertions.
pub(crate) fn recorder<T>() -> (Rc<RefCell<Vec<T>>>, impl Fn(T) + Clone) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |item| sink.borrow_mut().push(item))
}
