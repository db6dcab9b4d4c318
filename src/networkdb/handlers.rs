//! Inbound event handling and conflict resolution
//!
//! Each `handle_*_event` applies one event to the store under the write lock
//! and returns whether the event should be rebroadcast. Events are witnessed
//! on their clock before anything else, so even rejected events move the
//! local clock forward.
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::broadcast::BroadcastKey;
use super::messages::{
    decode_compound_message, decode_message, decode_payload, encode_raw_message, BulkSyncMessage,
    MessageType, NetworkEvent, NetworkEventType, NodeEvent, NodeEventType, TableEvent,
    TableEventType,
};
use super::types::{Entry, EntryKey, NetworkState, NodeState};
use super::watch::{publish, WatchEvent};
use super::NetworkDb;

impl NetworkDb {
    /// Apply a node join/leave event.
    pub fn handle_node_event(&self, event: &NodeEvent) -> bool {
        self.network_clock.witness(event.ltime);

        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return false;
            }
        };

        let Some(node) = state.find_node_mut(&event.node_name) else {
            return false;
        };
        if node.ltime >= event.ltime {
            return false;
        }
        node.ltime = event.ltime;

        // Only nodes the membership layer reports alive may change state here,
        // otherwise a dead node could be resurrected with no later failure notice.
        if !state.nodes.contains_key(&event.node_name) {
            return false;
        }

        let target = match event.event_type {
            NodeEventType::Join => NodeState::Active,
            NodeEventType::Leave => NodeState::Left,
        };
        let moved = self.change_node_state(&mut state, &event.node_name, target);
        if moved {
            info!(
                "[{}] Node {} event for {} at {}",
                self.config.node_name, target, event.node_name, event.ltime
            );
        }
        moved
    }

    /// Apply a remote node's network join/leave event.
    pub fn handle_network_event(&self, event: &NetworkEvent) -> bool {
        self.network_clock.witness(event.ltime);

        // The local node's own attachments are only changed locally
        if event.node_name == self.config.node_name {
            return false;
        }

        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return false;
            }
        };

        let leaving = event.event_type == NetworkEventType::Leave;
        let known = state
            .networks
            .get(&event.node_name)
            .and_then(|networks| networks.get(&event.network_id))
            .map(|n| n.ltime);

        match known {
            Some(ltime) => {
                if ltime >= event.ltime {
                    return false;
                }
                let reap_at = leaving.then(|| Instant::now() + self.config.reap_network_interval);
                if let Some(network) = state
                    .networks
                    .get_mut(&event.node_name)
                    .and_then(|networks| networks.get_mut(&event.network_id))
                {
                    network.ltime = event.ltime;
                    network.leaving = leaving;
                    network.reap_at = reap_at;
                }
                if leaving {
                    // Tombstone so bulk syncs keep spreading the deletes
                    self.delete_node_network_entries(&mut state, &event.network_id, &event.node_name);
                    state.delete_network_node(&event.network_id, &event.node_name);
                } else {
                    state.add_network_node(&event.network_id, &event.node_name);
                }
            }
            None => {
                if leaving {
                    return false;
                }
                if !state.nodes.contains_key(&event.node_name) {
                    return false;
                }
                state
                    .networks
                    .entry(event.node_name.clone())
                    .or_default()
                    .insert(
                        event.network_id.clone(),
                        NetworkState {
                            ltime: event.ltime,
                            leaving: false,
                            reap_at: None,
                        },
                    );
                state.add_network_node(&event.network_id, &event.node_name);
            }
        }

        debug!(
            "[{}] Node {} {} network {} at {}",
            self.config.node_name,
            event.node_name,
            if leaving { "left" } else { "joined" },
            event.network_id,
            event.ltime
        );
        true
    }

    /// Apply a table event using last-writer-wins on Lamport time.
    pub fn handle_table_event(&self, event: &TableEvent, is_bulk_sync: bool) -> bool {
        self.table_clock.witness(event.ltime);

        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                return false;
            }
        };

        let in_sync = match state.this_node_networks.get(&event.network_id) {
            Some(network) if !network.leaving => network.in_sync,
            _ => return false,
        };
        if !state.is_network_member(&event.network_id, &event.node_name) {
            return false;
        }

        let key = EntryKey::new(&event.network_id, &event.table_name, &event.key);
        let prev = state.entries.get(&key).cloned();
        if let Some(existing) = &prev {
            if existing.ltime >= event.ltime {
                return false;
            }
        }

        let deleting = event.event_type == TableEventType::Delete;
        let mut reap_time = Duration::from_secs(u64::from(event.residual_reap_time));
        if deleting && reap_time.is_zero() {
            warn!(
                "[{}] Delete of {}/{}/{} carries no reap time, are all nodes on the same version?",
                self.config.node_name, event.table_name, event.network_id, event.key
            );
            reap_time = self.config.reap_entry_interval;
        }

        state.entries.insert(
            key,
            Entry {
                ltime: event.ltime,
                node: event.node_name.clone(),
                value: event.value.clone(),
                deleting,
                reap_at: deleting.then(|| Instant::now() + reap_time),
            },
        );

        let notification = match (event.event_type, &prev) {
            (TableEventType::Delete, None) => {
                // Only bulk sync carries an up to date residual reap time for
                // entries we never saw, and near-expired deletes are not worth spreading.
                let divisor = self.config.rebroadcast_residual_divisor;
                return is_bulk_sync && in_sync && reap_time > self.config.reap_entry_interval / divisor;
            }
            (TableEventType::Delete, Some(prev)) if prev.deleting => None,
            (TableEventType::Delete, Some(prev)) => Some(WatchEvent::delete(
                &event.table_name,
                &event.network_id,
                &event.key,
                prev.value.clone(),
            )),
            (_, Some(prev)) if !prev.deleting => Some(WatchEvent::update(
                &event.table_name,
                &event.network_id,
                &event.key,
                event.value.clone(),
                prev.value.clone(),
            )),
            _ => Some(WatchEvent::create(
                &event.table_name,
                &event.network_id,
                &event.key,
                event.value.clone(),
            )),
        };
        if let Some(notification) = notification {
            publish(&mut state.watchers, notification);
        }

        in_sync
    }

    /// Decode and apply one envelope.
    pub fn handle_message(&self, buf: &[u8], is_bulk_sync: bool) {
        let (tag, payload) = match decode_message(buf) {
            Ok(parts) => parts,
            Err(e) => {
                error!("[{}] Error decoding gossip message: {}", self.config.node_name, e);
                return;
            }
        };

        match MessageType::try_from(tag) {
            Ok(MessageType::NetworkEvent) => self.handle_network_message(payload),
            Ok(MessageType::TableEvent) => self.handle_table_message(payload, is_bulk_sync),
            Ok(MessageType::BulkSync) => self.handle_bulk_sync(payload),
            Ok(MessageType::Compound) => self.handle_compound(payload, is_bulk_sync),
            Ok(MessageType::NodeEvent) => self.handle_node_message(payload),
            Ok(MessageType::PushPull) => {
                debug!(
                    "[{}] Ignoring push-pull state outside of a state merge",
                    self.config.node_name
                );
            }
            Err(e) => {
                error!("[{}] Dropping gossip message: {}", self.config.node_name, e);
            }
        }
    }

    fn handle_node_message(&self, payload: &[u8]) {
        let event: NodeEvent = match decode_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("[{}] Error decoding node event: {}", self.config.node_name, e);
                return;
            }
        };
        if self.handle_node_event(&event) {
            self.node_broadcasts.queue_broadcast(
                BroadcastKey::Node {
                    node_name: event.node_name,
                },
                encode_raw_message(MessageType::NodeEvent, payload),
            );
        }
    }

    fn handle_network_message(&self, payload: &[u8]) {
        let event: NetworkEvent = match decode_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("[{}] Error decoding network event: {}", self.config.node_name, e);
                return;
            }
        };
        if self.handle_network_event(&event) {
            self.network_broadcasts.queue_broadcast(
                BroadcastKey::Network {
                    network_id: event.network_id,
                    node_name: event.node_name,
                },
                encode_raw_message(MessageType::NetworkEvent, payload),
            );
        }
    }

    fn handle_table_message(&self, payload: &[u8], is_bulk_sync: bool) {
        let event: TableEvent = match decode_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("[{}] Error decoding table event: {}", self.config.node_name, e);
                return;
            }
        };

        // Our own events come back through peers; the local copy is authoritative
        if event.node_name == self.config.node_name {
            return;
        }

        if !self.handle_table_event(&event, is_bulk_sync) {
            return;
        }

        let relay = match self.read_state() {
            Ok(state) => match state.this_node_networks.get(&event.network_id) {
                Some(network) if !network.leaving => Some(network.table_rebroadcasts.clone()),
                _ => None,
            },
            Err(e) => {
                error!("[{}] {}", self.config.node_name, e);
                None
            }
        };
        let Some(relay) = relay else {
            return;
        };
        if is_bulk_sync && relay.num_queued() > self.config.max_queue_len_broadcast_on_sync {
            debug!(
                "[{}] Relay queue for network {} is full, not spreading synced event",
                self.config.node_name, event.network_id
            );
            return;
        }
        relay.queue_broadcast(
            BroadcastKey::Table {
                network_id: event.network_id,
                table_name: event.table_name,
                key: event.key,
            },
            encode_raw_message(MessageType::TableEvent, payload),
        );
    }

    fn handle_compound(&self, payload: &[u8], is_bulk_sync: bool) {
        let parts = match decode_compound_message(payload) {
            Ok(parts) => parts,
            Err(e) => {
                error!("[{}] Error decoding compound message: {}", self.config.node_name, e);
                return;
            }
        };
        for part in parts {
            self.handle_message(part, is_bulk_sync);
        }
    }

    fn handle_bulk_sync(&self, payload: &[u8]) {
        let msg: BulkSyncMessage = match decode_payload(payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!("[{}] Error decoding bulk sync: {}", self.config.node_name, e);
                return;
            }
        };

        if msg.ltime.value() > 0 {
            self.table_clock.witness(msg.ltime);
        }

        if !msg.payload.is_empty() {
            self.handle_message(&msg.payload, true);
        }

        if !msg.unsolicited {
            self.complete_bulk_sync(&msg.node_name);
            return;
        }

        if let Err(e) = self.send_bulk_sync(&msg.networks, &msg.node_name, false) {
            warn!(
                "[{}] Failed to answer bulk sync from {}: {}",
                self.config.node_name, msg.node_name, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::messages::encode_message;
    use super::super::test_support::*;
    use super::super::types::Node;
    use super::super::watch::WatchEventKind;
    use super::super::{EventDelegate, LamportTime};
    use super::*;

    fn table_event(
        event_type: TableEventType,
        ltime: u64,
        node: &str,
        value: &[u8],
        residual: u32,
    ) -> TableEvent {
        TableEvent {
            event_type,
            ltime: LamportTime(ltime),
            node_name: node.to_string(),
            network_id: "net1".to_string(),
            table_name: "endpoint_table".to_string(),
            key: "k1".to_string(),
            value: value.to_vec(),
            residual_reap_time: residual,
        }
    }

    /// node-a joined to net1 together with node-b.
    async fn joined_pair() -> std::sync::Arc<NetworkDb> {
        let (db, _) = new_db("node-a");
        db.notify_join(Node::new("node-b", addr(2)));
        db.join_network("net1").await.unwrap();
        assert!(db.handle_network_event(&NetworkEvent {
            event_type: NetworkEventType::Join,
            ltime: LamportTime(1),
            node_name: "node-b".to_string(),
            network_id: "net1".to_string(),
        }));
        db
    }

    #[tokio::test]
    async fn test_stale_table_event_rejected() {
        let db = joined_pair().await;
        assert!(db.handle_table_event(&table_event(TableEventType::Create, 5, "node-b", b"v5", 0), false));
        assert!(!db.handle_table_event(&table_event(TableEventType::Update, 5, "node-b", b"x", 0), false));
        assert!(!db.handle_table_event(&table_event(TableEventType::Update, 4, "node-b", b"x", 0), false));
        assert_eq!(db.get_entry("endpoint_table", "net1", "k1").unwrap(), b"v5".to_vec());
    }

    #[tokio::test]
    async fn test_table_event_witnesses_clock_even_when_rejected() {
        let (db, _) = new_db("node-a");
        assert!(!db.handle_table_event(&table_event(TableEventType::Create, 40, "node-b", b"v", 0), false));
        assert_eq!(db.table_time(), LamportTime(41));
    }

    #[tokio::test]
    async fn test_table_event_from_non_member_rejected() {
        let db = joined_pair().await;
        assert!(!db.handle_table_event(&table_event(TableEventType::Create, 5, "node-c", b"v", 0), false));
        assert!(db.get_entry("endpoint_table", "net1", "k1").is_err());
    }

    #[tokio::test]
    async fn test_update_before_create_notifies_create() {
        let db = joined_pair().await;
        let mut rx = db.watch("endpoint_table", "").unwrap();
        db.handle_table_event(&table_event(TableEventType::Update, 3, "node-b", b"v3", 0), false);
        let got = rx.try_recv().unwrap();
        assert_eq!(got.kind(), WatchEventKind::Create);
        assert_eq!(got.value, Some(b"v3".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_delete_rebroadcast_rules() {
        let db = joined_pair().await;
        let interval = db.config().reap_entry_interval.as_secs() as u32;
        let mut rx = db.watch("", "").unwrap();

        // Gossip-sourced deletes of unknown entries never spread
        assert!(!db.handle_table_event(&table_event(TableEventType::Delete, 5, "node-b", b"", interval), false));

        let mut high = table_event(TableEventType::Delete, 5, "node-b", b"", interval);
        high.key = "k2".to_string();
        assert!(db.handle_table_event(&high, true));

        let mut low = table_event(TableEventType::Delete, 5, "node-b", b"", interval / 6);
        low.key = "k3".to_string();
        assert!(!db.handle_table_event(&low, true));

        // Unknown deletes never notify
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_of_tombstone_not_notified() {
        let db = joined_pair().await;
        db.handle_table_event(&table_event(TableEventType::Create, 5, "node-b", b"v", 0), false);
        db.handle_table_event(&table_event(TableEventType::Delete, 6, "node-b", b"", 30), false);
        let mut rx = db.watch("endpoint_table", "net1").unwrap();
        db.handle_table_event(&table_event(TableEventType::Delete, 7, "node-b", b"", 30), false);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_own_table_events_ignored() {
        let db = joined_pair().await;
        let msg = encode_message(
            MessageType::TableEvent,
            &table_event(TableEventType::Create, 50, "node-a", b"v", 0),
        )
        .unwrap();
        db.handle_message(&msg, false);
        assert!(db.get_entry("endpoint_table", "net1", "k1").is_err());
    }

    #[tokio::test]
    async fn test_network_event_for_local_node_ignored() {
        let db = joined_pair().await;
        assert!(!db.handle_network_event(&NetworkEvent {
            event_type: NetworkEventType::Leave,
            ltime: LamportTime(100),
            node_name: "node-a".to_string(),
            network_id: "net1".to_string(),
        }));
        assert!(db.peers("net1").unwrap().iter().any(|p| p.name == "node-a"));
    }

    #[tokio::test]
    async fn test_network_leave_tombstones_entries() {
        let db = joined_pair().await;
        db.handle_table_event(&table_event(TableEventType::Create, 5, "node-b", b"v", 0), false);
        let mut rx = db.watch("", "").unwrap();
        assert!(db.handle_network_event(&NetworkEvent {
            event_type: NetworkEventType::Leave,
            ltime: LamportTime(2),
            node_name: "node-b".to_string(),
            network_id: "net1".to_string(),
        }));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.kind(), WatchEventKind::Delete);
        assert_eq!(got.prev, Some(b"v".to_vec()));

        let state = db.read_state().unwrap();
        let entry = &state.entries[&EntryKey::new("net1", "endpoint_table", "k1")];
        assert!(entry.deleting);
        assert!(!state.is_network_member("net1", "node-b"));
        assert!(state.networks["node-b"]["net1"].leaving);
    }

    #[tokio::test]
    async fn test_unknown_network_leave_dropped() {
        let (db, _) = new_db("node-a");
        db.notify_join(Node::new("node-b", addr(2)));
        assert!(!db.handle_network_event(&NetworkEvent {
            event_type: NetworkEventType::Leave,
            ltime: LamportTime(3),
            node_name: "node-b".to_string(),
            network_id: "net1".to_string(),
        }));
        // Unknown to membership
        assert!(!db.handle_network_event(&NetworkEvent {
            event_type: NetworkEventType::Join,
            ltime: LamportTime(3),
            node_name: "node-z".to_string(),
            network_id: "net1".to_string(),
        }));
        assert_eq!(db.network_time(), LamportTime(4));
    }

    #[tokio::test]
    async fn test_node_leave_event_moves_node() {
        let db = joined_pair().await;
        let event = NodeEvent {
            event_type: NodeEventType::Leave,
            ltime: LamportTime(10),
            node_name: "node-b".to_string(),
        };
        assert!(db.handle_node_event(&event));
        // Duplicate is stale
        assert!(!db.handle_node_event(&event));
        let state = db.read_state().unwrap();
        assert!(state.left_nodes.contains_key("node-b"));
        assert!(!state.is_network_member("net1", "node-b"));
        assert!(!state.networks.contains_key("node-b"));
    }

    #[tokio::test]
    async fn test_rebroadcast_queues_on_relay() {
        let db = joined_pair().await;
        let msg = encode_message(
            MessageType::TableEvent,
            &table_event(TableEventType::Create, 5, "node-b", b"v", 0),
        )
        .unwrap();
        db.handle_message(&msg, false);
        let state = db.read_state().unwrap();
        let network = &state.this_node_networks["net1"];
        assert_eq!(network.table_rebroadcasts.num_queued(), 1);
    }

    fn keyed_event(key: &str, ltime: u64) -> Vec<u8> {
        let mut event = table_event(TableEventType::Create, ltime, "node-b", b"v", 0);
        event.key = key.to_string();
        encode_message(MessageType::TableEvent, &event).unwrap()
    }

    #[tokio::test]
    async fn test_full_relay_queue_holds_back_synced_events() {
        let mut config = crate::settings::NetworkDbConfig::new("node-a", addr(1));
        config.max_queue_len_broadcast_on_sync = 2;
        let db = std::sync::Arc::new(
            NetworkDb::new(config, std::sync::Arc::new(RecordingTransport::default())).unwrap(),
        );
        db.notify_join(Node::new("node-b", addr(2)));
        db.join_network("net1").await.unwrap();
        assert!(db.handle_network_event(&NetworkEvent {
            event_type: NetworkEventType::Join,
            ltime: LamportTime(1),
            node_name: "node-b".to_string(),
            network_id: "net1".to_string(),
        }));
        let queued = || {
            let state = db.read_state().unwrap();
            state.this_node_networks["net1"].table_rebroadcasts.num_queued()
        };

        for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
            db.handle_message(&keyed_event(key, 5 + i as u64), false);
        }
        assert_eq!(queued(), 3);

        // Applied locally but not relayed
        db.handle_message(&keyed_event("k4", 10), true);
        assert_eq!(db.get_entry("endpoint_table", "net1", "k4").unwrap(), b"v".to_vec());
        assert_eq!(queued(), 3);

        // Plain gossip still relays past the limit
        db.handle_message(&keyed_event("k5", 11), false);
        assert_eq!(queued(), 4);
    }

    #[tokio::test]
    async fn test_table_events_dropped_while_leaving() {
        let db = joined_pair().await;
        db.leave_network("net1").unwrap();
        assert!(!db.handle_table_event(&table_event(TableEventType::Create, 5, "node-b", b"v", 0), false));
        assert!(!db.handle_table_event(&table_event(TableEventType::Create, 6, "node-b", b"v", 0), true));
        let state = db.read_state().unwrap();
        assert!(!state.entries.contains_key(&EntryKey::new("net1", "endpoint_table", "k1")));
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_tags_dropped() {
        let db = joined_pair().await;
        db.handle_message(&[], false);
        db.handle_message(&[42, 1, 2, 3], false);
        db.handle_message(&[MessageType::TableEvent.as_u8(), 0xff], false);
        assert!(db.get_table_by_network("endpoint_table", "net1").unwrap().is_empty());
    }
}
