//! Rendezvous boundary: nickname -> reachable peer endpoints.
//!
//! How advertisements propagate is the host's business. The core only asks
//! for endpoints when a Requester starts, and emits `Advertise`/`Withdraw`
//! actions when Receivers start and stop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Error;

/// Where a nickname can be dialed. `address` is opaque to the core; the host's
/// secure transport interprets it (socket address, in-memory agent name, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub nickname: String,
    pub address: String,
}

/// Resolves a nickname. Fails with `PeerUnavailable` when nothing is known.
pub trait Rendezvous {
    fn resolve(&self, nickname: &str) -> Result<Vec<PeerEndpoint>, Error>;
}

/// In-process directory. Clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    entries: Rc<RefCell<HashMap<String, Vec<PeerEndpoint>>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `nickname` is reachable at `address`. Duplicates are ignored.
    pub fn register(&self, nickname: &str, address: &str) {
        let endpoint = PeerEndpoint {
            nickname: nickname.to_string(),
            address: address.to_string(),
        };
        let mut entries = self.entries.borrow_mut();
        let list = entries.entry(nickname.to_string()).or_default();
        if !list.contains(&endpoint) {
            list.push(endpoint);
        }
    }

    pub fn unregister(&self, nickname: &str, address: &str) {
        let mut entries = self.entries.borrow_mut();
        if let Some(list) = entries.get_mut(nickname) {
            list.retain(|e| e.address != address);
            if list.is_empty() {
                entries.remove(nickname);
            }
        }
    }
}

impl Rendezvous for MemoryRendezvous {
    fn resolve(&self, nickname: &str) -> Result<Vec<PeerEndpoint>, Error> {
        match self.entries.borrow().get(nickname) {
            Some(list) if !list.is_empty() => Ok(list.clone()),
            _ => Err(Error::PeerUnavailable(nickname.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_nickname_is_unavailable() {
        let r = MemoryRendezvous::new();
        assert_eq!(
            r.resolve("ghost"),
            Err(Error::PeerUnavailable("ghost".into()))
        );
    }

    #[test]
    fn register_unregister() {
        let r = MemoryRendezvous::new();
        r.register("tv", "agent-a");
        r.register("tv", "agent-a");
        r.register("tv", "agent-b");
        assert_eq!(r.resolve("tv").unwrap().len(), 2);
        r.unregister("tv", "agent-a");
        let left = r.resolve("tv").unwrap();
        assert_eq!(left[0].address, "agent-b");
        r.unregister("tv", "agent-b");
        assert!(r.resolve("tv").is_err());
    }
}
