//! Liveness bookkeeping for the static topology
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rand::seq::SliceRandom;

/// What a heartbeat changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliveChange {
    /// First heartbeat, or first since the peer was declared failed
    Joined,
    /// Known live peer announced a new address
    Moved,
    Unchanged,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    addr: SocketAddr,
    last_seen: Instant,
    alive: bool,
    /// Set once a push-pull with this peer has completed
    synced: bool,
}

/// Peers keyed by node name.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: IndexMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alive(&mut self, name: &str, addr: SocketAddr, now: Instant) -> AliveChange {
        match self.peers.get_mut(name) {
            Some(peer) => {
                peer.last_seen = now;
                if !peer.alive {
                    peer.alive = true;
                    peer.addr = addr;
                    peer.synced = false;
                    AliveChange::Joined
                } else if peer.addr != addr {
                    peer.addr = addr;
                    AliveChange::Moved
                } else {
                    AliveChange::Unchanged
                }
            }
            None => {
                self.peers.insert(
                    name.to_string(),
                    PeerEntry {
                        addr,
                        last_seen: now,
                        alive: true,
                        synced: false,
                    },
                );
                AliveChange::Joined
            }
        }
    }

    /// Mark live peers silent for longer than `timeout` as failed and return their names.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, peer) in self.peers.iter_mut() {
            if peer.alive && now.saturating_duration_since(peer.last_seen) > timeout {
                peer.alive = false;
                failed.push(name.clone());
            }
        }
        failed
    }

    pub fn addr_of(&self, name: &str) -> Option<SocketAddr> {
        self.peers.get(name).filter(|p| p.alive).map(|p| p.addr)
    }

    pub fn is_synced(&self, name: &str) -> bool {
        self.peers.get(name).is_some_and(|p| p.synced)
    }

    pub fn mark_synced(&mut self, name: &str) {
        if let Some(peer) = self.peers.get_mut(name) {
            peer.synced = true;
        }
    }

    pub fn alive(&self) -> Vec<(String, SocketAddr)> {
        self.peers
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(name, p)| (name.clone(), p.addr))
            .collect()
    }

    /// Up to `count` live peers in random order.
    pub fn random_alive(&self, count: usize) -> Vec<(String, SocketAddr)> {
        let mut alive = self.alive();
        alive.shuffle(&mut rand::rng());
        alive.truncate(count);
        alive
    }

    pub fn num_alive(&self) -> usize {
        self.peers.values().filter(|p| p.alive).count()
    }
}
