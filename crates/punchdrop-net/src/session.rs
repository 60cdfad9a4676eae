//! Coordination session: a rendezvous id holding at most two peer slots.

use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;

pub const MAX_PEERS: usize = 2;

/// One registered peer within a session.
pub struct PeerSlot {
    pub endpoint: SocketAddr,
    pub nonce: [u8; 32],
    pub authenticated: bool,
}

impl PeerSlot {
    fn new(endpoint: SocketAddr) -> PeerSlot {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        PeerSlot {
            endpoint,
            nonce,
            authenticated: false,
        }
    }
}

/// A session between two peers, keyed by the shared session id.
pub struct Session {
    session_id: String,
    last_activity: Instant,
    peers: Vec<PeerSlot>,
}

impl Session {
    pub fn new(session_id: &str) -> Session {
        Session {
            session_id: session_id.to_string(),
            last_activity: Instant::now(),
            peers: Vec::with_capacity(MAX_PEERS),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn find_peer(&self, endpoint: SocketAddr) -> Option<&PeerSlot> {
        self.peers.iter().find(|slot| slot.endpoint == endpoint)
    }

    pub fn find_peer_mut(&mut self, endpoint: SocketAddr) -> Option<&mut PeerSlot> {
        self.peers.iter_mut().find(|slot| slot.endpoint == endpoint)
    }

    /// Register a new peer. Returns `None` when both slots are taken.
    pub fn add_peer(&mut self, endpoint: SocketAddr) -> Option<&PeerSlot> {
        if self.peers.len() >= MAX_PEERS {
            return None;
        }
        self.peers.push(PeerSlot::new(endpoint));
        self.touch();
        self.peers.last()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= MAX_PEERS
    }

    pub fn both_authenticated(&self) -> bool {
        self.peers.len() == MAX_PEERS && self.peers.iter().all(|slot| slot.authenticated)
    }

    pub fn peers(&self) -> &[PeerSlot] {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn holds_at_most_two_peers() {
        let mut session = Session::new("s");
        assert!(session.add_peer(ep(1)).is_some());
        assert!(session.add_peer(ep(2)).is_some());
        assert!(session.is_full());
        assert!(session.add_peer(ep(3)).is_none());
    }

    #[test]
    fn nonces_are_distinct_per_slot() {
        let mut session = Session::new("s");
        session.add_peer(ep(1));
        session.add_peer(ep(2));
        let peers = session.peers();
        assert_ne!(peers[0].nonce, peers[1].nonce);
    }

    #[test]
    fn both_authenticated_requires_both() {
        let mut session = Session::new("s");
        session.add_peer(ep(1));
        assert!(!session.both_authenticated());
        session.add_peer(ep(2));
        assert!(!session.both_authenticated());
        session.find_peer_mut(ep(1)).unwrap().authenticated = true;
        assert!(!session.both_authenticated());
        session.find_peer_mut(ep(2)).unwrap().authenticated = true;
        assert!(session.both_authenticated());
    }
}
