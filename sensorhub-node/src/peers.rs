//! Registry of known peers.
//!
//! Peers are keyed by their immutable `node_id`; addresses can change via
//! PEER_LIST refreshes. `phi` and the status transitions are reserved for
//! accrual failure detection — the dispatcher refreshes `last_seen_ms` on
//! every valid inbound frame, but nothing here drives alive → suspected
//! → dead yet.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::proto::{now_ms, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Alive,
    Suspected,
    Dead,
}

/// One known peer.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// Wall-clock millis of the last valid inbound frame from this peer.
    pub last_seen_ms: i64,
    /// Accrual score, reserved.
    pub phi: f64,
    pub status: PeerStatus,
}

impl Peer {
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Thread-safe peer registry. Never stores this node's own identity.
pub struct PeerTable {
    self_id: String,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerTable {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a peer first seen now. Returns true when the peer was new;
    /// a known peer is left untouched (use [`PeerTable::refresh_address`]).
    /// The node's own identity is never stored.
    pub fn learn(&self, node_id: &str, host: &str, port: u16) -> bool {
        if node_id == self.self_id {
            return false;
        }
        let mut peers = self.peers.lock();
        if peers.contains_key(node_id) {
            return false;
        }
        tracing::info!(peer = %node_id, %host, port, "learned new peer");
        peers.insert(
            node_id.to_string(),
            Peer {
                node_id: node_id.to_string(),
                host: host.to_string(),
                port,
                last_seen_ms: now_ms(),
                phi: 0.0,
                status: PeerStatus::Alive,
            },
        );
        true
    }

    /// Update a known peer's address if it changed. Liveness fields are
    /// left alone — an address gossiped third-hand says nothing about
    /// whether the peer is reachable.
    pub fn refresh_address(&self, node_id: &str, host: &str, port: u16) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(node_id) {
            if peer.host != host || peer.port != port {
                tracing::info!(peer = %node_id, %host, port, "peer address updated");
                peer.host = host.to_string();
                peer.port = port;
            }
        }
    }

    /// Refresh `last_seen_ms` for a known peer. Returns whether the peer
    /// is known.
    pub fn touch(&self, node_id: &str) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(node_id) {
            Some(peer) => {
                peer.last_seen_ms = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.lock().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Copy of the table, sorted by `node_id` for deterministic output.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_identity_is_never_stored() {
        let table = PeerTable::new("n1");
        assert!(!table.learn("n1", "127.0.0.1", 7171));
        assert!(table.is_empty());
    }

    #[test]
    fn learn_is_first_write_only() {
        let table = PeerTable::new("n1");
        assert!(table.learn("n2", "10.0.0.2", 7171));
        assert!(!table.learn("n2", "10.0.0.99", 9999));
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].host, "10.0.0.2");
        assert_eq!(snap[0].status, PeerStatus::Alive);
        assert_eq!(snap[0].phi, 0.0);
    }

    #[test]
    fn refresh_changes_address_but_not_liveness() {
        let table = PeerTable::new("n1");
        table.learn("n2", "10.0.0.2", 7171);
        let seen_before = table.snapshot()[0].last_seen_ms;

        table.refresh_address("n2", "10.0.0.3", 7272);
        let snap = table.snapshot();
        assert_eq!(snap[0].host, "10.0.0.3");
        assert_eq!(snap[0].port, 7272);
        assert_eq!(snap[0].last_seen_ms, seen_before);
    }

    #[test]
    fn touch_only_known_peers() {
        let table = PeerTable::new("n1");
        assert!(!table.touch("ghost"));
        table.learn("n2", "10.0.0.2", 7171);
        assert!(table.touch("n2"));
    }

    #[test]
    fn snapshot_is_sorted_by_node_id() {
        let table = PeerTable::new("n1");
        table.learn("n3", "h", 1);
        table.learn("n2", "h", 1);
        let ids: Vec<String> = table.snapshot().into_iter().map(|p| p.node_id).collect();
        assert_eq!(ids, ["n2", "n3"]);
    }
}
