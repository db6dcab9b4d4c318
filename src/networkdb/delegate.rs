//! Contracts between the store and the membership layer
//!
//! The membership layer owns failure detection and the wire. It calls into
//! the store through [`Delegate`] (gossip payloads and state exchange) and
//! [`EventDelegate`] (membership changes), and the store sends through
//! [`ClusterTransport`].
use tracing::{debug, error, info, warn};

use super::broadcast::get_broadcasts_from;
use super::messages::{
    decode_typed, encode_message, MessageType, NetworkEntry, NetworkEvent, NetworkEventType,
    NetworkPushPull, NodeEvent, NodeEventType,
};
use super::types::{Node, NodeState, PeerInfo};
use super::watch::{publish, WatchEvent, NODE_TABLE};
use super::{DbState, NetworkDb};
use crate::error::Result;

/// Outbound sends offered by the membership layer.
///
/// Both calls only enqueue and must not block on the network.
pub trait ClusterTransport: Send + Sync {
    /// Unreliable datagram send.
    fn send_best_effort(&self, node: &Node, msg: Vec<u8>) -> Result<()>;

    /// Ordered, reliable send.
    fn send_reliable(&self, node: &Node, msg: Vec<u8>) -> Result<()>;
}

/// Gossip callbacks invoked by the membership layer.
pub trait Delegate: Send + Sync {
    /// Metadata attached to the local node's membership record.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived over gossip.
    fn notify_msg(&self, buf: &[u8]);

    /// Messages to piggyback on an outgoing membership packet.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Snapshot for a push-pull exchange.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Merge a snapshot received in a push-pull exchange.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change callbacks.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: Node);
    fn notify_leave(&self, name: &str);
    fn notify_update(&self, node: Node);
}

impl NetworkDb {
    /// Stamp every local network with a fresh network time so a peer we
    /// rejoin after a partition prefers our state over stale leave records.
    pub(crate) fn update_local_network_time(&self) -> Result<()> {
        let mut state = self.write_state()?;
        let ltime = self.network_clock.increment();
        for network in state.this_node_networks.values_mut() {
            network.ltime = ltime;
        }
        Ok(())
    }

    fn push_pull_snapshot(&self) -> Result<NetworkPushPull> {
        let state = self.read_state()?;
        let mut networks: Vec<NetworkEntry> = state
            .this_node_networks
            .iter()
            .map(|(nid, network)| NetworkEntry {
                network_id: nid.clone(),
                ltime: network.ltime,
                node_name: self.config.node_name.clone(),
                leaving: network.leaving,
            })
            .collect();
        for (node_name, node_networks) in &state.networks {
            for (nid, network) in node_networks {
                networks.push(NetworkEntry {
                    network_id: nid.clone(),
                    ltime: network.ltime,
                    node_name: node_name.clone(),
                    leaving: network.leaving,
                });
            }
        }
        Ok(NetworkPushPull {
            ltime: self.network_clock.time(),
            node_name: self.config.node_name.clone(),
            networks,
        })
    }

    fn publish_node_event(&self, state: &mut DbState, node: &Node, joined: bool) {
        let peer = PeerInfo {
            name: node.name.clone(),
            addr: node.addr,
        };
        let value = match serde_json::to_vec(&peer) {
            Ok(value) => value,
            Err(e) => {
                error!("[{}] Failed to encode node address: {}", self.config.node_name, e);
                return;
            }
        };
        let event = if joined {
            WatchEvent::create(NODE_TABLE, "", &node.name, value)
        } else {
            WatchEvent::delete(NODE_TABLE, "", &node.name, value)
        };
        publish(&mut state.watchers, event);
    }

    /// A new incarnation of a node reuses its address under a new name; retire
    /// the old record so its entries are cleaned up.
    fn purge_reincarnation(&self, state: &mut DbState, node: &Node) -> bool {
        let stale = state
            .nodes
            .values()
            .chain(state.failed_nodes.values())
            .chain(state.left_nodes.values())
            .find(|known| {
                known.addr == node.addr
                    && known.name != node.name
                    && known.name != self.config.node_name
            })
            .map(|known| known.name.clone());

        match stale {
            Some(name) => {
                info!(
                    "[{}] Node {}/{} is the new incarnation of {}",
                    self.config.node_name, node.name, node.addr, name
                );
                self.change_node_state(state, &name, NodeState::Left);
                true
            }
            None => false,
        }
    }
}

impl Delegate for NetworkDb {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        self.handle_message(buf, false);
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let num_nodes = match self.read_state() {
            Ok(state) => state.nodes.len(),
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return Vec::new();
            }
        };
        get_broadcasts_from(
            overhead,
            limit,
            num_nodes,
            &[&self.network_broadcasts, &self.node_broadcasts],
        )
    }

    fn local_state(&self, join: bool) -> Vec<u8> {
        if join {
            if let Err(e) = self.update_local_network_time() {
                error!("[{}] {}", self.config.node_name, e);
            }
        }
        let snapshot = match self.push_pull_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("[{}] Failed to snapshot network state: {}", self.config.node_name, e);
                return Vec::new();
            }
        };
        match encode_message(MessageType::PushPull, &snapshot) {
            Ok(buf) => buf,
            Err(e) => {
                error!("[{}] Failed to encode local state: {}", self.config.node_name, e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            error!("[{}] Zero byte remote network state received", self.config.node_name);
            return;
        }
        let snapshot: NetworkPushPull = match decode_typed(MessageType::PushPull, buf) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("[{}] Failed to decode remote network state: {}", self.config.node_name, e);
                return;
            }
        };
        debug!(
            "[{}] Merging {} network records from {} (join={})",
            self.config.node_name,
            snapshot.networks.len(),
            snapshot.node_name,
            join
        );

        self.handle_node_event(&NodeEvent {
            event_type: NodeEventType::Join,
            ltime: snapshot.ltime,
            node_name: snapshot.node_name,
        });
        for entry in snapshot.networks {
            self.handle_network_event(&NetworkEvent {
                event_type: if entry.leaving {
                    NetworkEventType::Leave
                } else {
                    NetworkEventType::Join
                },
                ltime: entry.ltime,
                node_name: entry.node_name,
                network_id: entry.network_id,
            });
        }
    }
}

impl EventDelegate for NetworkDb {
    fn notify_join(&self, node: Node) {
        info!(
            "[{}] Node {}/{} joined gossip cluster",
            self.config.node_name, node.name, node.addr
        );
        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return;
            }
        };
        self.publish_node_event(&mut state, &node, true);

        if self.change_node_state(&mut state, &node.name, NodeState::Active) {
            return;
        }
        if state.nodes.contains_key(&node.name) {
            return;
        }
        self.purge_reincarnation(&mut state, &node);
        info!(
            "[{}] Node {}/{} added to nodes list",
            self.config.node_name, node.name, node.addr
        );
        state.nodes.insert(node.name.clone(), node);
    }

    fn notify_leave(&self, name: &str) {
        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return;
            }
        };
        let Some((node, current)) = state.find_node(name).map(|(n, s)| (n.clone(), s)) else {
            warn!("[{}] Node {} not found in the node lists", self.config.node_name, name);
            return;
        };
        info!(
            "[{}] Node {}/{} left gossip cluster",
            self.config.node_name, node.name, node.addr
        );
        self.publish_node_event(&mut state, &node, false);

        // An active node that never announced leaving has failed
        if current == NodeState::Active {
            self.change_node_state(&mut state, name, NodeState::Failed);
        }
    }

    fn notify_update(&self, node: Node) {
        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return;
            }
        };
        if let Some(known) = state.find_node_mut(&node.name) {
            known.addr = node.addr;
        }
    }
}
