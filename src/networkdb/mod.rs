//! NetworkDB: a gossip-replicated store of network membership and table entries
//!
//! Every node keeps its own copy of the cluster's node list, each node's
//! network attachments, and the table entries of the networks it belongs to.
//! Changes spread by piggybacking on the membership layer's gossip and by
//! periodic point-to-point bulk syncs. Conflicts resolve last-writer-wins on
//! Lamport time.
pub mod broadcast;
pub mod bulk_sync;
pub mod clock;
pub mod delegate;
pub mod handlers;
pub mod messages;
pub mod reaper;
pub mod table;
pub mod types;
pub mod watch;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::settings::NetworkDbConfig;

pub use broadcast::{BroadcastKey, BroadcastQueue};
pub use clock::{LamportClock, LamportTime};
pub use delegate::{ClusterTransport, Delegate, EventDelegate};
pub use types::{Entry, EntryKey, LocalNetwork, NetworkState, Node, NodeState, PeerInfo, TableElem};
pub use watch::{WatchEvent, WatchEventKind, WatchReceiver, NODE_TABLE};

use messages::{make_compound_message, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD};
use watch::{publish, Watcher};

/// A registered wait for a bulk sync reply.
#[derive(Debug)]
pub(crate) struct BulkSyncAck {
    pub(crate) token: u64,
    pub(crate) done: oneshot::Sender<()>,
}

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
pub(crate) struct DbState {
    /// Active cluster members, including the local node
    pub(crate) nodes: HashMap<String, Node>,
    pub(crate) left_nodes: HashMap<String, Node>,
    pub(crate) failed_nodes: HashMap<String, Node>,
    /// Remote node name to its network attachments
    pub(crate) networks: HashMap<String, HashMap<String, NetworkState>>,
    /// Networks the local node belongs to
    pub(crate) this_node_networks: HashMap<String, LocalNetwork>,
    /// Network id to the names of its current members
    pub(crate) network_nodes: HashMap<String, Vec<String>>,
    pub(crate) entries: BTreeMap<EntryKey, Entry>,
    pub(crate) watchers: Vec<Watcher>,
    pub(crate) bulk_sync_acks: HashMap<String, Vec<BulkSyncAck>>,
    next_ack_token: u64,
}

impl DbState {
    /// Look a node up in every membership list.
    pub(crate) fn find_node(&self, name: &str) -> Option<(&Node, NodeState)> {
        if let Some(node) = self.nodes.get(name) {
            return Some((node, NodeState::Active));
        }
        if let Some(node) = self.left_nodes.get(name) {
            return Some((node, NodeState::Left));
        }
        self.failed_nodes
            .get(name)
            .map(|node| (node, NodeState::Failed))
    }

    fn find_node_mut(&mut self, name: &str) -> Option<&mut Node> {
        if let Some(node) = self.nodes.get_mut(name) {
            return Some(node);
        }
        if let Some(node) = self.left_nodes.get_mut(name) {
            return Some(node);
        }
        self.failed_nodes.get_mut(name)
    }

    fn remove_node(&mut self, name: &str) -> Option<(Node, NodeState)> {
        if let Some(node) = self.nodes.remove(name) {
            return Some((node, NodeState::Active));
        }
        if let Some(node) = self.left_nodes.remove(name) {
            return Some((node, NodeState::Left));
        }
        self.failed_nodes
            .remove(name)
            .map(|node| (node, NodeState::Failed))
    }

    pub(crate) fn add_network_node(&mut self, network_id: &str, node_name: &str) {
        let members = self
            .network_nodes
            .entry(network_id.to_string())
            .or_default();
        if !members.iter().any(|n| n == node_name) {
            members.push(node_name.to_string());
        }
    }

    pub(crate) fn delete_network_node(&mut self, network_id: &str, node_name: &str) {
        if let Some(members) = self.network_nodes.get_mut(network_id) {
            members.retain(|n| n != node_name);
        }
    }

    pub(crate) fn is_network_member(&self, network_id: &str, node_name: &str) -> bool {
        self.network_nodes
            .get(network_id)
            .is_some_and(|members| members.iter().any(|n| n == node_name))
    }

    pub(crate) fn network_member_count(&self, network_id: &str) -> usize {
        self.network_nodes.get(network_id).map_or(0, Vec::len)
    }

    /// Keys of every entry (live or tombstoned) in a network.
    pub(crate) fn network_entry_keys(&self, network_id: &str) -> Vec<EntryKey> {
        let start = EntryKey::new(network_id, "", "");
        self.entries
            .range(start..)
            .take_while(|(k, _)| k.network_id == network_id)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn next_ack_token(&mut self) -> u64 {
        self.next_ack_token += 1;
        self.next_ack_token
    }
}

/// The store. One instance per node, shared behind an `Arc`.
pub struct NetworkDb {
    config: NetworkDbConfig,
    state: RwLock<DbState>,
    /// Orders node and network events
    network_clock: LamportClock,
    /// Orders table events
    table_clock: LamportClock,
    network_broadcasts: BroadcastQueue,
    node_broadcasts: BroadcastQueue,
    transport: Arc<dyn ClusterTransport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDb")
            .field("node_name", &self.config.node_name)
            .field("network_clock", &self.network_clock.time())
            .field("table_clock", &self.table_clock.time())
            .finish()
    }
}

impl NetworkDb {
    pub fn new(config: NetworkDbConfig, transport: Arc<dyn ClusterTransport>) -> Result<Self> {
        config.validate()?;
        info!(
            "[{}] Creating NetworkDB node advertising {}",
            config.node_name, config.advertise_addr
        );

        let mut state = DbState::default();
        state.nodes.insert(
            config.node_name.clone(),
            Node::new(config.node_name.clone(), config.advertise_addr),
        );

        Ok(Self {
            network_broadcasts: BroadcastQueue::new("network", config.retransmit_mult),
            node_broadcasts: BroadcastQueue::new("node", config.retransmit_mult),
            config,
            state: RwLock::new(state),
            network_clock: LamportClock::new(),
            table_clock: LamportClock::new(),
            transport,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &NetworkDbConfig {
        &self.config
    }

    pub fn network_time(&self) -> LamportTime {
        self.network_clock.time()
    }

    pub fn table_time(&self) -> LamportTime {
        self.table_clock.time()
    }

    pub(crate) fn read_state(&self) -> Result<RwLockReadGuard<'_, DbState>> {
        self.state
            .read()
            .map_err(|e| crate::concurrency_error!("NetworkDB lock poisoned: {}", e))
    }

    pub(crate) fn write_state(&self) -> Result<RwLockWriteGuard<'_, DbState>> {
        self.state
            .write()
            .map_err(|e| crate::concurrency_error!("NetworkDB lock poisoned: {}", e))
    }

    /// Move a node between membership lists.
    ///
    /// Returns whether the node actually moved. Leaving or failing detaches the
    /// node from every network and drops everything it owns.
    pub(crate) fn change_node_state(
        &self,
        state: &mut DbState,
        name: &str,
        new_state: NodeState,
    ) -> bool {
        let Some((mut node, current)) = state.remove_node(name) else {
            return false;
        };
        if current == new_state {
            match current {
                NodeState::Active => state.nodes.insert(name.to_string(), node),
                NodeState::Left => state.left_nodes.insert(name.to_string(), node),
                NodeState::Failed => state.failed_nodes.insert(name.to_string(), node),
            };
            return false;
        }

        match new_state {
            NodeState::Active => {
                node.reap_at = None;
                state.nodes.insert(name.to_string(), node);
            }
            NodeState::Left | NodeState::Failed => {
                // A failed node that later reports leaving keeps its first deadline
                if node.reap_at.is_none() {
                    node.reap_at = Some(Instant::now() + self.config.node_reap_interval);
                }
                if new_state == NodeState::Left {
                    state.left_nodes.insert(name.to_string(), node);
                } else {
                    state.failed_nodes.insert(name.to_string(), node);
                }
                self.delete_node_from_networks(state, name);
                self.delete_node_table_entries(state, name);
            }
        }
        debug!(
            "[{}] Node {} moved from {} to {}",
            self.config.node_name, name, current, new_state
        );
        true
    }

    pub(crate) fn delete_node_from_networks(&self, state: &mut DbState, name: &str) {
        for members in state.network_nodes.values_mut() {
            members.retain(|n| n != name);
        }
        state.networks.remove(name);
    }

    /// Forget every entry owned by `name`, notifying a Delete for the live ones.
    ///
    /// Removed outright, not tombstoned: a returning owner resends them at
    /// their original times.
    pub(crate) fn delete_node_table_entries(&self, state: &mut DbState, name: &str) {
        let owned: Vec<EntryKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.node == name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            let Some(entry) = state.entries.remove(&key) else {
                continue;
            };
            if entry.deleting {
                continue;
            }
            publish(
                &mut state.watchers,
                WatchEvent::delete(&key.table, &key.network_id, &key.key, entry.value),
            );
        }
    }

    /// Tombstone the entries `name` owns in one network.
    pub(crate) fn delete_node_network_entries(
        &self,
        state: &mut DbState,
        network_id: &str,
        name: &str,
    ) {
        let reap_at = Instant::now() + self.config.reap_entry_interval;
        for key in state.network_entry_keys(network_id) {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            if entry.node != name || entry.deleting {
                continue;
            }
            entry.deleting = true;
            entry.reap_at = Some(reap_at);
            publish(
                &mut state.watchers,
                WatchEvent::delete(&key.table, &key.network_id, &key.key, entry.value.clone()),
            );
        }
    }

    /// Up to `m` members picked at random, never the local node.
    pub(crate) fn random_nodes(&self, m: usize, nodes: &[String]) -> Vec<String> {
        let mut candidates: Vec<String> = nodes
            .iter()
            .filter(|n| **n != self.config.node_name)
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(m);
        candidates
    }

    /// Spawn table gossip, periodic bulk sync and the reaper.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|e| crate::concurrency_error!("Mutex lock fail {}", e))?;
        if !tasks.is_empty() {
            return Ok(());
        }

        info!(
            "[{}] Starting NetworkDB tasks: gossip every {}ms, bulk sync every {}s, reap every {}s",
            self.config.node_name,
            self.config.gossip_interval.as_millis(),
            self.config.bulk_sync_interval.as_secs(),
            self.config.reap_period.as_secs()
        );

        let db = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut timer = time::interval(db.config.gossip_interval);
            loop {
                timer.tick().await;
                db.gossip();
            }
        }));

        let db = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut timer = time::interval(db.config.bulk_sync_interval);
            // The first tick fires immediately; join already synced
            timer.tick().await;
            loop {
                timer.tick().await;
                db.bulk_sync_tables().await;
            }
        }));

        let db = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut timer = time::interval(db.config.reap_period);
            loop {
                timer.tick().await;
                db.reap_state();
            }
        }));
        Ok(())
    }

    /// Stop the periodic tasks.
    pub fn close(&self) {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                for task in tasks.drain(..) {
                    task.abort();
                }
                info!("[{}] NetworkDB tasks stopped", self.config.node_name);
            }
            Err(e) => error!("[{}] Mutex lock fail {}", self.config.node_name, e),
        }
    }

    /// Send pending table events of every local network to a few random members.
    pub fn gossip(&self) {
        let rounds: Vec<(String, Vec<String>, Arc<BroadcastQueue>, Arc<BroadcastQueue>, usize)> = {
            let state = match self.read_state() {
                Ok(state) => state,
                Err(e) => {
                    error!("[{}] Gossip skipped: {}", self.config.node_name, e);
                    return;
                }
            };
            state
                .this_node_networks
                .iter()
                .map(|(nid, network)| {
                    let members = state.network_nodes.get(nid).cloned().unwrap_or_default();
                    let count = members.len();
                    (
                        nid.clone(),
                        members,
                        Arc::clone(&network.table_broadcasts),
                        Arc::clone(&network.table_rebroadcasts),
                        count,
                    )
                })
                .collect()
        };

        let bytes_avail = self
            .config
            .packet_buffer_size
            .saturating_sub(COMPOUND_HEADER_OVERHEAD);
        for (nid, members, local, relayed, count) in rounds {
            let targets = self.random_nodes(self.config.gossip_fanout, &members);
            // Keep the transmit budget until someone can hear it
            if targets.is_empty() {
                continue;
            }
            let msgs = broadcast::get_broadcasts_from(
                COMPOUND_OVERHEAD,
                bytes_avail,
                count,
                &[local.as_ref(), relayed.as_ref()],
            );
            if msgs.is_empty() {
                continue;
            }
            let compound = match make_compound_message(&msgs) {
                Ok(compound) => compound,
                Err(e) => {
                    error!(
                        "[{}] Failed to build gossip for network {}: {}",
                        self.config.node_name, nid, e
                    );
                    continue;
                }
            };
            for target in targets {
                let node = match self.read_state() {
                    Ok(state) => state.nodes.get(&target).cloned(),
                    Err(_) => None,
                };
                let Some(node) = node else {
                    continue;
                };
                if let Err(e) = self.transport.send_best_effort(&node, compound.clone()) {
                    debug!(
                        "[{}] Failed to gossip network {} to {}: {}",
                        self.config.node_name, nid, node.name, e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::networkdb::delegate::ClusterTransport;

    /// Records every outbound message instead of sending it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) best_effort: Mutex<Vec<(String, Vec<u8>)>>,
        pub(crate) reliable: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ClusterTransport for RecordingTransport {
        fn send_best_effort(&self, node: &Node, msg: Vec<u8>) -> Result<()> {
            self.best_effort.lock().unwrap().push((node.name.clone(), msg));
            Ok(())
        }

        fn send_reliable(&self, node: &Node, msg: Vec<u8>) -> Result<()> {
            self.reliable.lock().unwrap().push((node.name.clone(), msg));
            Ok(())
        }
    }

    pub(crate) fn addr(last: u8) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([10, 0, 0, last], 7946))
    }

    pub(crate) fn new_db(name: &str) -> (Arc<NetworkDb>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let config = NetworkDbConfig::new(name, addr(1));
        let db = NetworkDb::new(config, transport.clone()).unwrap();
        (Arc::new(db), transport)
    }
}
