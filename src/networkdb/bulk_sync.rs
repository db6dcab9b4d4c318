//! Anti-entropy: point-to-point exchange of full table state
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::messages::{
    encode_message, make_compound_message, BulkSyncMessage, MessageType, TableEvent,
    TableEventType,
};
use super::{BulkSyncAck, NetworkDb};
use crate::error::{NetworkDbError, Result};

/// A pending bulk sync acknowledgement, released when dropped.
struct AckRegistration<'a> {
    db: &'a NetworkDb,
    node: &'a str,
    token: u64,
}

impl Drop for AckRegistration<'_> {
    fn drop(&mut self) {
        self.db.unregister_bulk_sync(self.node, self.token);
    }
}

impl NetworkDb {
    /// Networks the local node shares with `node_name`, leaving ones excluded.
    pub fn find_common_networks(&self, node_name: &str) -> Result<Vec<String>> {
        let state = self.read_state()?;
        let Some(remote) = state.networks.get(node_name) else {
            return Ok(Vec::new());
        };
        let mut networks: Vec<String> = state
            .this_node_networks
            .keys()
            .filter(|nid| remote.get(*nid).is_some_and(|n| !n.leaving))
            .cloned()
            .collect();
        networks.sort();
        Ok(networks)
    }

    /// Periodic bulk sync of every local network with a random member.
    ///
    /// A successful sync covers every network shared with that peer, so those
    /// networks are skipped for the rest of the round.
    pub async fn bulk_sync_tables(&self) {
        let mut pending: Vec<String> = match self.read_state() {
            Ok(state) => state
                .this_node_networks
                .iter()
                .filter(|(_, network)| !network.leaving)
                .map(|(nid, _)| nid.clone())
                .collect(),
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return;
            }
        };

        while let Some(nid) = pending.pop() {
            let members = match self.read_state() {
                Ok(state) => state.network_nodes.get(&nid).cloned().unwrap_or_default(),
                Err(_) => continue,
            };
            if members.is_empty() {
                continue;
            }

            match self.bulk_sync(&members, false).await {
                Ok(completed) => pending.retain(|n| !completed.contains(n)),
                Err(e) => warn!(
                    "[{}] Periodic bulk sync failure for network {}: {}",
                    self.config.node_name, nid, e
                ),
            }
        }
    }

    /// Bulk sync with `nodes`: every one of them when `all`, otherwise two
    /// random members where the second is only tried if the first fails.
    ///
    /// Returns the networks covered by the last successful sync.
    pub async fn bulk_sync(&self, nodes: &[String], all: bool) -> Result<Vec<String>> {
        let targets = if all {
            nodes
                .iter()
                .filter(|n| **n != self.config.node_name)
                .cloned()
                .collect()
        } else {
            self.random_nodes(2, nodes)
        };

        let mut last_err = None;
        let mut synced = None;
        for node in targets {
            debug!("[{}] Initiating bulk sync with node {}", self.config.node_name, node);
            let networks = self.find_common_networks(&node)?;
            match self.bulk_sync_node(&networks, &node, true).await {
                Ok(()) => {
                    synced = Some(networks);
                    if !all {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        "[{}] Bulk sync to node {} failed: {}",
                        self.config.node_name, node, e
                    );
                    last_err = Some(e);
                }
            }
        }

        match (synced, last_err) {
            (Some(networks), _) => Ok(networks),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Send our entries of `networks` to `node`.
    ///
    /// An unsolicited sync waits for the peer's reply, bounded by the bulk
    /// sync timeout.
    pub async fn bulk_sync_node(
        &self,
        networks: &[String],
        node: &str,
        unsolicited: bool,
    ) -> Result<()> {
        if !unsolicited {
            return self.send_bulk_sync(networks, node, false);
        }

        let (token, done) = self.register_bulk_sync(node)?;
        // Unregisters on every exit, including when this future is dropped
        let _registration = AckRegistration {
            db: self,
            node,
            token,
        };
        self.send_bulk_sync(networks, node, true)?;

        let started = Instant::now();
        match tokio::time::timeout(self.config.bulk_sync_timeout, done).await {
            Ok(Ok(())) => {
                debug!(
                    "[{}] Bulk sync with {} completed in {:?}",
                    self.config.node_name,
                    node,
                    started.elapsed()
                );
                Ok(())
            }
            Ok(Err(_)) => Err(crate::concurrency_error!(
                "bulk sync acknowledgement for {} dropped",
                node
            )),
            Err(_) => Err(NetworkDbError::Timeout(format!(
                "bulk sync to node {} timed out after {:?}",
                node, self.config.bulk_sync_timeout
            ))),
        }
    }

    /// Encode and reliably send a bulk sync message without waiting.
    pub(crate) fn send_bulk_sync(
        &self,
        networks: &[String],
        node: &str,
        unsolicited: bool,
    ) -> Result<()> {
        let (target, msgs) = {
            let state = self.read_state()?;
            let target = state
                .nodes
                .get(node)
                .cloned()
                .ok_or_else(|| NetworkDbError::NodeNotFound(node.to_string()))?;

            let now = Instant::now();
            let mut msgs = Vec::new();
            for nid in networks {
                for key in state.network_entry_keys(nid) {
                    let Some(entry) = state.entries.get(&key) else {
                        continue;
                    };
                    let event = TableEvent {
                        event_type: if entry.deleting {
                            TableEventType::Delete
                        } else {
                            TableEventType::Create
                        },
                        ltime: entry.ltime,
                        node_name: entry.node.clone(),
                        network_id: key.network_id,
                        table_name: key.table,
                        key: key.key,
                        value: entry.value.clone(),
                        residual_reap_time: entry.residual_reap_time(now),
                    };
                    msgs.push(encode_message(MessageType::TableEvent, &event)?);
                }
            }
            (target, msgs)
        };

        debug!(
            "[{}] Sending {} bulk sync of {} entries for networks {:?} to {}",
            self.config.node_name,
            if unsolicited { "unsolicited" } else { "reply" },
            msgs.len(),
            networks,
            node
        );

        let msg = BulkSyncMessage {
            ltime: self.table_clock.time(),
            unsolicited,
            node_name: self.config.node_name.clone(),
            networks: networks.to_vec(),
            payload: make_compound_message(&msgs)?,
        };
        let buf = encode_message(MessageType::BulkSync, &msg)?;
        self.transport.send_reliable(&target, buf)
    }

    fn register_bulk_sync(&self, node: &str) -> Result<(u64, oneshot::Receiver<()>)> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.write_state()?;
        let token = state.next_ack_token();
        state
            .bulk_sync_acks
            .entry(node.to_string())
            .or_default()
            .push(BulkSyncAck { token, done: tx });
        Ok((token, rx))
    }

    /// Drop one registration, leaving concurrent waits on the same peer alone.
    fn unregister_bulk_sync(&self, node: &str, token: u64) {
        let Ok(mut state) = self.write_state() else {
            return;
        };
        if let Some(acks) = state.bulk_sync_acks.get_mut(node) {
            acks.retain(|ack| ack.token != token);
            if acks.is_empty() {
                state.bulk_sync_acks.remove(node);
            }
        }
    }

    /// A reply from `node` arrived: release everyone waiting on it.
    pub(crate) fn complete_bulk_sync(&self, node: &str) {
        let acks = match self.write_state() {
            Ok(mut state) => state.bulk_sync_acks.remove(node),
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return;
            }
        };
        for ack in acks.into_iter().flatten() {
            let _ = ack.done.send(());
        }
    }
}
