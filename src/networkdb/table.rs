//! Local operations: network membership, entry mutation and reads
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use super::broadcast::BroadcastKey;
use super::messages::{
    encode_message, MessageType, NetworkEvent, NetworkEventType, NodeEvent, NodeEventType,
    TableEvent, TableEventType,
};
use super::types::{Entry, EntryKey, LocalNetwork, PeerInfo, TableElem};
use super::watch::{publish, WatchEvent, WatchReceiver, Watcher};
use super::{LamportTime, NetworkDb};
use crate::error::{NetworkDbError, Result};

impl NetworkDb {
    /// Join a network and pull its current state from every member.
    pub async fn join_network(self: &Arc<Self>, network_id: &str) -> Result<()> {
        let ltime = self.network_clock.increment();
        let members = {
            let mut state = self.write_state()?;
            match state.this_node_networks.get_mut(network_id) {
                Some(network) if !network.leaving => {
                    return Err(NetworkDbError::NetworkAlreadyJoined(network_id.to_string()));
                }
                Some(network) => {
                    // Rejoining before the leave was reaped keeps the queues
                    network.ltime = ltime;
                    network.leaving = false;
                    network.reap_at = None;
                    network.in_sync = false;
                }
                None => {
                    state.this_node_networks.insert(
                        network_id.to_string(),
                        LocalNetwork::new(network_id, ltime, self.config.retransmit_mult),
                    );
                }
            }
            state.add_network_node(network_id, &self.config.node_name);
            state.network_nodes.get(network_id).cloned().unwrap_or_default()
        };

        self.send_network_event(network_id, NetworkEventType::Join, ltime)?;
        info!("[{}] Joined network {}", self.config.node_name, network_id);

        // The initial sync runs on its own task so the network still reaches
        // in-sync if the caller stops waiting
        let db = Arc::clone(self);
        let nid = network_id.to_string();
        let sync = tokio::spawn(async move {
            if let Err(e) = db.bulk_sync(&members, true).await {
                error!(
                    "[{}] Error bulk syncing while joining network {}: {}",
                    db.config.node_name, nid, e
                );
            }
            db.mark_in_sync(&nid);
        });
        if let Err(e) = sync.await {
            error!(
                "[{}] Join sync task for network {} failed: {}",
                self.config.node_name, network_id, e
            );
        }
        Ok(())
    }

    fn mark_in_sync(&self, network_id: &str) {
        match self.write_state() {
            Ok(mut state) => {
                // A leave issued meanwhile wins
                if let Some(network) = state
                    .this_node_networks
                    .get_mut(network_id)
                    .filter(|n| !n.leaving)
                {
                    network.in_sync = true;
                }
            }
            Err(e) => error!("[{}] {}", self.config.node_name, e),
        }
    }

    /// Leave a network: announce it, tombstone our entries and forget everyone else's.
    pub fn leave_network(&self, network_id: &str) -> Result<()> {
        let ltime = {
            let mut guard = self.write_state()?;
            let state = &mut *guard;
            match state.this_node_networks.get(network_id) {
                Some(network) if !network.leaving => {}
                _ => return Err(NetworkDbError::NetworkNotFound(network_id.to_string())),
            }
            let ltime = self.network_clock.increment();

            state.delete_network_node(network_id, &self.config.node_name);

            let reap_at = Instant::now() + self.config.reap_entry_interval;
            for key in state.network_entry_keys(network_id) {
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                let was_live = !entry.deleting;
                let prev = entry.value.clone();
                if entry.node == self.config.node_name {
                    // Newer than anything we sent, so peers that still hold
                    // the live entry accept the delete
                    entry.ltime = entry.ltime.next();
                    entry.deleting = true;
                    entry.reap_at = Some(reap_at);
                } else {
                    state.entries.remove(&key);
                }
                if was_live {
                    publish(
                        &mut state.watchers,
                        WatchEvent::delete(&key.table, &key.network_id, &key.key, prev),
                    );
                }
            }

            if let Some(network) = state.this_node_networks.get_mut(network_id) {
                network.ltime = ltime;
                network.leaving = true;
                network.reap_at = Some(Instant::now() + self.config.reap_network_interval);
            }
            ltime
        };

        self.send_network_event(network_id, NetworkEventType::Leave, ltime)?;
        info!("[{}] Left network {}", self.config.node_name, network_id);
        Ok(())
    }

    /// Announce that the local node is leaving the cluster.
    pub fn leave_cluster(&self) -> Result<()> {
        let event = NodeEvent {
            event_type: NodeEventType::Leave,
            ltime: self.network_clock.increment(),
            node_name: self.config.node_name.clone(),
        };
        let msg = encode_message(MessageType::NodeEvent, &event)?;
        self.node_broadcasts.queue_broadcast(
            BroadcastKey::Node {
                node_name: self.config.node_name.clone(),
            },
            msg,
        );
        info!("[{}] Leaving cluster", self.config.node_name);
        Ok(())
    }

    pub fn create_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        let entry = {
            let mut state = self.write_state()?;
            let entry_key = EntryKey::new(network_id, table, key);
            if state.entries.get(&entry_key).is_some_and(|e| !e.deleting) {
                return Err(NetworkDbError::EntryExists {
                    table: table.to_string(),
                    network_id: network_id.to_string(),
                    key: key.to_string(),
                });
            }
            let entry = Entry {
                ltime: self.table_clock.increment(),
                node: self.config.node_name.clone(),
                value,
                deleting: false,
                reap_at: None,
            };
            state.entries.insert(entry_key, entry.clone());
            entry
        };
        self.send_table_event(TableEventType::Create, table, network_id, key, &entry)
    }

    pub fn update_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        let entry = {
            let mut state = self.write_state()?;
            let entry_key = EntryKey::new(network_id, table, key);
            if !state.entries.get(&entry_key).is_some_and(|e| !e.deleting) {
                return Err(NetworkDbError::EntryNotFound {
                    table: table.to_string(),
                    network_id: network_id.to_string(),
                    key: key.to_string(),
                });
            }
            let entry = Entry {
                ltime: self.table_clock.increment(),
                node: self.config.node_name.clone(),
                value,
                deleting: false,
                reap_at: None,
            };
            state.entries.insert(entry_key, entry.clone());
            entry
        };
        self.send_table_event(TableEventType::Update, table, network_id, key, &entry)
    }

    pub fn delete_entry(&self, table: &str, network_id: &str, key: &str) -> Result<()> {
        let entry = {
            let mut state = self.write_state()?;
            let entry_key = EntryKey::new(network_id, table, key);
            let value = match state.entries.get(&entry_key) {
                Some(existing) if !existing.deleting => existing.value.clone(),
                _ => {
                    return Err(NetworkDbError::EntryNotFound {
                        table: table.to_string(),
                        network_id: network_id.to_string(),
                        key: key.to_string(),
                    })
                }
            };
            let entry = Entry {
                ltime: self.table_clock.increment(),
                node: self.config.node_name.clone(),
                value,
                deleting: true,
                reap_at: Some(Instant::now() + self.config.reap_entry_interval),
            };
            state.entries.insert(entry_key, entry.clone());
            entry
        };
        self.send_table_event(TableEventType::Delete, table, network_id, key, &entry)
    }

    fn send_table_event(
        &self,
        event_type: TableEventType,
        table: &str,
        network_id: &str,
        key: &str,
        entry: &Entry,
    ) -> Result<()> {
        let event = TableEvent {
            event_type,
            ltime: entry.ltime,
            node_name: self.config.node_name.clone(),
            network_id: network_id.to_string(),
            table_name: table.to_string(),
            key: key.to_string(),
            value: entry.value.clone(),
            residual_reap_time: entry.residual_reap_time(Instant::now()),
        };
        let msg = encode_message(MessageType::TableEvent, &event)?;

        let queue = {
            let state = self.read_state()?;
            state
                .this_node_networks
                .get(network_id)
                .map(|network| network.table_broadcasts.clone())
        };
        // The network may be gone already
        let Some(queue) = queue else {
            debug!(
                "[{}] Not broadcasting {}/{}: network {} not joined",
                self.config.node_name, table, key, network_id
            );
            return Ok(());
        };
        queue.queue_broadcast(
            BroadcastKey::Table {
                network_id: network_id.to_string(),
                table_name: table.to_string(),
                key: key.to_string(),
            },
            msg,
        );
        Ok(())
    }

    fn send_network_event(
        &self,
        network_id: &str,
        event_type: NetworkEventType,
        ltime: LamportTime,
    ) -> Result<()> {
        let event = NetworkEvent {
            event_type,
            ltime,
            node_name: self.config.node_name.clone(),
            network_id: network_id.to_string(),
        };
        let msg = encode_message(MessageType::NetworkEvent, &event)?;
        self.network_broadcasts.queue_broadcast(
            BroadcastKey::Network {
                network_id: network_id.to_string(),
                node_name: self.config.node_name.clone(),
            },
            msg,
        );
        Ok(())
    }

    /// Value of a live entry.
    pub fn get_entry(&self, table: &str, network_id: &str, key: &str) -> Result<Vec<u8>> {
        let state = self.read_state()?;
        match state.entries.get(&EntryKey::new(network_id, table, key)) {
            Some(entry) if !entry.deleting => Ok(entry.value.clone()),
            _ => Err(NetworkDbError::EntryNotFound {
                table: table.to_string(),
                network_id: network_id.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Every live entry of one table in one network, keyed by entry key.
    pub fn get_table_by_network(
        &self,
        table: &str,
        network_id: &str,
    ) -> Result<HashMap<String, TableElem>> {
        let state = self.read_state()?;
        let start = EntryKey::new(network_id, table, "");
        Ok(state
            .entries
            .range(start..)
            .take_while(|(k, _)| k.network_id == network_id && k.table == table)
            .filter(|(_, entry)| !entry.deleting)
            .map(|(k, entry)| {
                (
                    k.key.clone(),
                    TableElem {
                        value: entry.value.clone(),
                        owner: entry.node.clone(),
                    },
                )
            })
            .collect())
    }

    /// Visit every entry of a table across all networks, tombstones included,
    /// as `f(network_id, key, value, deleting)`. Stops once `f` returns true.
    ///
    /// `f` runs on a snapshot, outside the store lock.
    pub fn walk_table<F>(&self, table: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &str, &[u8], bool) -> bool,
    {
        let snapshot: Vec<(EntryKey, Entry)> = {
            let state = self.read_state()?;
            state
                .entries
                .iter()
                .filter(|(k, _)| k.table == table)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect()
        };
        for (key, entry) in snapshot {
            if f(&key.network_id, &key.key, &entry.value, entry.deleting) {
                break;
            }
        }
        Ok(())
    }

    /// Members of a network.
    pub fn peers(&self, network_id: &str) -> Result<Vec<PeerInfo>> {
        let state = self.read_state()?;
        let Some(members) = state.network_nodes.get(network_id) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|name| match state.nodes.get(name) {
                Some(node) => Some(PeerInfo {
                    name: node.name.clone(),
                    addr: node.addr,
                }),
                None => {
                    debug!(
                        "[{}] Network {} member {} missing from node list",
                        self.config.node_name, network_id, name
                    );
                    None
                }
            })
            .collect())
    }

    /// Active cluster members, the local node included.
    pub fn cluster_peers(&self) -> Result<Vec<PeerInfo>> {
        let state = self.read_state()?;
        let mut peers: Vec<PeerInfo> = state
            .nodes
            .values()
            .map(|node| PeerInfo {
                name: node.name.clone(),
                addr: node.addr,
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(peers)
    }

    /// Subscribe to changes. Empty `table` or `network_id` match everything.
    ///
    /// The receiver first yields a create for every matching live entry.
    pub fn watch(&self, table: &str, network_id: &str) -> Result<WatchReceiver> {
        let (watcher, rx) = Watcher::new(table, network_id);
        let mut state = self.write_state()?;
        for (key, entry) in &state.entries {
            if entry.deleting || !watcher.matches(&key.table, &key.network_id) {
                continue;
            }
            let _ = watcher.tx.send(WatchEvent::create(
                &key.table,
                &key.network_id,
                &key.key,
                entry.value.clone(),
            ));
        }
        state.watchers.push(watcher);
        Ok(rx)
    }
}
