//! Host loop: the one place the protocol core runs.
//!
//! Network tasks and the tick timer feed it; it hands core actions to the
//! transport engine and the rendezvous beacon. Everything touching the
//! `Agent` stays on this loop's thread.

use std::collections::HashMap;
use std::rc::Rc;

use lp2p_core::{Agent, ConnectionId, Error, OutboundAction};
use tokio::sync::{mpsc, Notify};

use crate::discovery::Advertised;
use crate::transport::{Engine, NetEvent, WriterCmd};

/// Application-side handle. Clone freely within the local task set.
#[derive(Clone)]
pub struct Node {
    agent: Rc<Agent>,
    wake: Rc<Notify>,
}

impl Node {
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Call after acting on a handle outside a callback so the loop flushes
    /// what the core queued.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

pub struct Host {
    node: Node,
    engine: Engine,
    advertised: Advertised,
    writers: HashMap<ConnectionId, mpsc::UnboundedSender<WriterCmd>>,
}

impl Host {
    pub fn new(agent: Agent, engine: Engine, advertised: Advertised) -> Self {
        Self {
            node: Node {
                agent: Rc::new(agent),
                wake: Rc::new(Notify::new()),
            },
            engine,
            advertised,
            writers: HashMap::new(),
        }
    }

    pub fn node(&self) -> Node {
        self.node.clone()
    }

    /// Run until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<NetEvent>, tick: std::time::Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let wake = self.node.wake.clone();
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.on_net_event(ev),
                    None => break,
                },
                _ = interval.tick() => self.node.agent.tick(),
                _ = wake.notified() => {}
            }
            self.flush();
        }
        tracing::info!("host loop stopped");
    }

    fn on_net_event(&mut self, ev: NetEvent) {
        let agent = &self.node.agent;
        match ev {
            NetEvent::Accepted { connection, writer } => {
                self.writers.insert(connection, writer);
                agent.on_connection_accepted(connection);
            }
            NetEvent::Dialed { dial, result } => match result {
                Ok((connection, writer)) => {
                    self.writers.insert(connection, writer);
                    agent.on_dial_result(dial, Ok(connection));
                }
                Err(reason) => agent.on_dial_result(dial, Err(Error::TransportSetupFailed(reason))),
            },
            NetEvent::Frame { connection, frame } => {
                if let Err(e) = agent.on_frame(connection, &frame) {
                    tracing::warn!(?connection, %e, "frame refused by core");
                }
            }
            NetEvent::Closed { connection } => {
                self.writers.remove(&connection);
                agent.on_connection_closed(connection);
            }
        }
    }

    /// Run callbacks and carry out actions until the core is quiet.
    fn flush(&mut self) {
        loop {
            self.node.agent.dispatch();
            let actions = self.node.agent.poll_actions();
            if actions.is_empty() && !self.node.agent.has_pending_work() {
                return;
            }
            for action in actions {
                self.perform(action);
            }
        }
    }

    fn perform(&mut self, action: OutboundAction) {
        match action {
            OutboundAction::Advertise { nickname } => {
                tracing::info!(%nickname, "advertising");
                self.advertised.insert(&nickname);
            }
            OutboundAction::Withdraw { nickname } => {
                tracing::info!(%nickname, "withdrawn");
                self.advertised.remove(&nickname);
            }
            OutboundAction::Dial { dial, endpoint } => {
                tracing::debug!(?dial, address = %endpoint.address, "dialing");
                self.engine.dial(dial, endpoint.address);
            }
            OutboundAction::SendFrame { connection, frame } => match self.writers.get(&connection) {
                Some(tx) => {
                    if tx.send(WriterCmd::Frame(frame)).is_err() {
                        tracing::debug!(?connection, "frame for a finished writer dropped");
                    }
                }
                None => tracing::debug!(?connection, "frame for unknown connection dropped"),
            },
            OutboundAction::Close { connection } => {
                if let Some(tx) = self.writers.remove(&connection) {
                    let _ = tx.send(WriterCmd::Close);
                }
            }
        }
    }
}
