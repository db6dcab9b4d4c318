use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::broadcast::BroadcastQueue;
use super::clock::LamportTime;

/// A cluster member as known by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    /// Time of the newest node event applied for this node
    pub ltime: LamportTime,
    /// Set once the node leaves or fails
    pub reap_at: Option<Instant>,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            ltime: LamportTime::default(),
            reap_at: None,
        }
    }
}

/// Which membership list a node currently sits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Left,
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => write!(f, "active"),
            NodeState::Left => write!(f, "left"),
            NodeState::Failed => write!(f, "failed"),
        }
    }
}

/// A remote node's membership in one network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkState {
    pub ltime: LamportTime,
    pub leaving: bool,
    pub reap_at: Option<Instant>,
}

/// The local node's membership in one network.
#[derive(Clone, Debug)]
pub struct LocalNetwork {
    pub ltime: LamportTime,
    pub leaving: bool,
    pub reap_at: Option<Instant>,
    /// Set once the join-time bulk sync has run
    pub in_sync: bool,
    /// Table events originated by this node
    pub table_broadcasts: Arc<BroadcastQueue>,
    /// Table events relayed on behalf of other nodes
    pub table_rebroadcasts: Arc<BroadcastQueue>,
}

impl LocalNetwork {
    pub fn new(network_id: &str, ltime: LamportTime, retransmit_mult: usize) -> Self {
        Self {
            ltime,
            leaving: false,
            reap_at: None,
            in_sync: false,
            table_broadcasts: Arc::new(BroadcastQueue::new(
                format!("table/{}", network_id),
                retransmit_mult,
            )),
            table_rebroadcasts: Arc::new(BroadcastQueue::new(
                format!("table-relay/{}", network_id),
                retransmit_mult,
            )),
        }
    }
}

/// Index of an entry. Ordering groups entries by network, then table, so
/// per-network and per-table scans are range scans.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub network_id: String,
    pub table: String,
    pub key: String,
}

impl EntryKey {
    pub fn new(network_id: &str, table: &str, key: &str) -> Self {
        Self {
            network_id: network_id.to_string(),
            table: table.to_string(),
            key: key.to_string(),
        }
    }
}

/// One table entry. Deleted entries stay behind as tombstones until reaped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub ltime: LamportTime,
    /// Node that owns the entry
    pub node: String,
    pub value: Vec<u8>,
    pub deleting: bool,
    pub reap_at: Option<Instant>,
}

impl Entry {
    /// Whole seconds left before the tombstone is reaped, as sent on the wire.
    pub fn residual_reap_time(&self, now: Instant) -> u32 {
        match self.reap_at {
            Some(reap_at) => {
                u32::try_from(reap_at.saturating_duration_since(now).as_secs()).unwrap_or(u32::MAX)
            }
            None => 0,
        }
    }

    pub fn is_reapable(&self, now: Instant) -> bool {
        self.deleting && self.reap_at.is_some_and(|reap_at| reap_at <= now)
    }
}

/// A live table value together with its owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableElem {
    pub value: Vec<u8>,
    pub owner: String,
}

/// Public view of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub addr: SocketAddr,
}
