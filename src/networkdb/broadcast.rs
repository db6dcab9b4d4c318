//! Transmit-limited broadcast queue
//!
//! Pending gossip is held here until it has been piggybacked enough times to
//! reach the whole cluster with high probability. Every item has a dedup key:
//! queueing a newer message for a key replaces the older one, so the queue
//! never carries two versions of the same fact.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::error;

/// Identity of a queued broadcast. Items with equal keys supersede each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastKey {
    Node {
        node_name: String,
    },
    Network {
        network_id: String,
        node_name: String,
    },
    Table {
        network_id: String,
        table_name: String,
        key: String,
    },
}

#[derive(Debug)]
struct QueuedBroadcast {
    msg: Vec<u8>,
    transmits: usize,
    // Insertion order, newer items win ties
    id: u64,
}

/// Number of times a message is sent before it is dropped from the queue.
///
/// Scales with the log of the cluster size: `mult * ceil(log10(n + 1))`.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    retransmit_mult * node_scale
}

/// A bounded-retransmission queue of encoded messages.
///
/// Each queue carries its own lock so draining one domain never contends
/// with another or with the store lock.
#[derive(Debug)]
pub struct BroadcastQueue {
    name: String,
    retransmit_mult: usize,
    items: Mutex<HashMap<BroadcastKey, QueuedBroadcast>>,
    next_id: AtomicU64,
}

impl BroadcastQueue {
    pub fn new(name: impl Into<String>, retransmit_mult: usize) -> Self {
        Self {
            name: name.into(),
            retransmit_mult,
            items: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message, replacing any pending message with the same key.
    pub fn queue_broadcast(&self, key: BroadcastKey, msg: Vec<u8>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.items.lock() {
            Ok(mut items) => {
                items.insert(
                    key,
                    QueuedBroadcast {
                        msg,
                        transmits: 0,
                        id,
                    },
                );
            }
            Err(e) => error!("[{}] Broadcast queue lock poisoned: {}", self.name, e),
        }
    }

    /// Number of pending messages.
    pub fn num_queued(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    /// Drop every pending message.
    pub fn reset(&self) {
        if let Ok(mut items) = self.items.lock() {
            items.clear();
        }
    }

    /// Select messages to piggyback on an outgoing packet.
    ///
    /// Each selected message costs `overhead + len` bytes of `limit`. Messages
    /// sent fewer times go first, newest first among equals. A message is
    /// removed once it has been sent `retransmit_limit` times for a cluster of
    /// `num_nodes`.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        let mut items = match self.items.lock() {
            Ok(items) => items,
            Err(e) => {
                error!("[{}] Broadcast queue lock poisoned: {}", self.name, e);
                return Vec::new();
            }
        };
        if items.is_empty() {
            return Vec::new();
        }

        let transmit_limit = retransmit_limit(self.retransmit_mult, num_nodes).max(1);

        let mut order: Vec<(usize, u64, BroadcastKey)> = items
            .iter()
            .map(|(key, item)| (item.transmits, item.id, key.clone()))
            .collect();
        order.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut used = 0usize;
        let mut selected = Vec::new();
        for (_, _, key) in order {
            let Some(item) = items.get_mut(&key) else {
                continue;
            };
            let cost = overhead + item.msg.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            selected.push(item.msg.clone());

            item.transmits += 1;
            if item.transmits >= transmit_limit {
                items.remove(&key);
            }
        }
        selected
    }
}

/// Drain several queues in order under one shared byte budget.
pub fn get_broadcasts_from(
    overhead: usize,
    limit: usize,
    num_nodes: usize,
    queues: &[&BroadcastQueue],
) -> Vec<Vec<u8>> {
    let mut remaining = limit;
    let mut msgs = Vec::new();
    for queue in queues {
        let batch = queue.get_broadcasts(overhead, remaining, num_nodes);
        let used: usize = batch.iter().map(|m| overhead + m.len()).sum();
        remaining = remaining.saturating_sub(used);
        msgs.extend(batch);
        if remaining == 0 {
            break;
        }
    }
    msgs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_key(key: &str) -> BroadcastKey {
        BroadcastKey::Table {
            network_id: "net1".to_string(),
            table_name: "endpoint_table".to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn test_retransmit_limit_scales_with_cluster() {
        assert_eq!(retransmit_limit(4, 0), 0);
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(4, 9), 4);
        assert_eq!(retransmit_limit(4, 10), 8);
        assert_eq!(retransmit_limit(4, 99), 8);
        assert_eq!(retransmit_limit(4, 100), 12);
    }

    #[test]
    fn test_same_key_supersedes() {
        let queue = BroadcastQueue::new("table", 4);
        queue.queue_broadcast(table_key("k1"), b"old".to_vec());
        queue.queue_broadcast(table_key("k1"), b"new".to_vec());
        queue.queue_broadcast(table_key("k2"), b"other".to_vec());
        assert_eq!(queue.num_queued(), 2);

        let msgs = queue.get_broadcasts(0, 1024, 3);
        assert!(msgs.contains(&b"new".to_vec()));
        assert!(!msgs.contains(&b"old".to_vec()));
    }

    #[test]
    fn test_different_key_kinds_do_not_collide() {
        let queue = BroadcastQueue::new("mixed", 4);
        queue.queue_broadcast(
            BroadcastKey::Node {
                node_name: "a".to_string(),
            },
            vec![1],
        );
        queue.queue_broadcast(
            BroadcastKey::Network {
                network_id: "a".to_string(),
                node_name: "a".to_string(),
            },
            vec![2],
        );
        assert_eq!(queue.num_queued(), 2);
    }

    #[test]
    fn test_byte_budget_respected() {
        let queue = BroadcastQueue::new("table", 4);
        for i in 0..10 {
            queue.queue_broadcast(table_key(&format!("k{}", i)), vec![0u8; 100]);
        }
        // 3 messages of 100 bytes plus 2 bytes overhead each fit in 310
        let msgs = queue.get_broadcasts(2, 310, 3);
        assert_eq!(msgs.len(), 3);
        assert_eq!(queue.num_queued(), 10);
    }

    #[test]
    fn test_items_dropped_after_transmit_limit() {
        let queue = BroadcastQueue::new("node", 2);
        queue.queue_broadcast(table_key("k1"), b"msg".to_vec());

        // One node: limit = 2 * ceil(log10(2)) = 2
        assert_eq!(queue.get_broadcasts(0, 1024, 1).len(), 1);
        assert_eq!(queue.num_queued(), 1);
        assert_eq!(queue.get_broadcasts(0, 1024, 1).len(), 1);
        assert_eq!(queue.num_queued(), 0);
        assert!(queue.get_broadcasts(0, 1024, 1).is_empty());
    }

    #[test]
    fn test_fresh_items_drain_first() {
        let queue = BroadcastQueue::new("table", 10);
        queue.queue_broadcast(table_key("old"), b"old".to_vec());
        // Send "old" once so it has more transmits than anything new
        assert_eq!(queue.get_broadcasts(0, 3, 1), vec![b"old".to_vec()]);

        queue.queue_broadcast(table_key("new"), b"new".to_vec());
        assert_eq!(queue.get_broadcasts(0, 3, 1), vec![b"new".to_vec()]);
    }

    #[test]
    fn test_newest_first_among_equal_transmits() {
        let queue = BroadcastQueue::new("table", 10);
        queue.queue_broadcast(table_key("a"), b"a".to_vec());
        queue.queue_broadcast(table_key("b"), b"b".to_vec());
        assert_eq!(queue.get_broadcasts(0, 1, 1), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_reset() {
        let queue = BroadcastQueue::new("table", 4);
        queue.queue_broadcast(table_key("k1"), b"msg".to_vec());
        queue.reset();
        assert_eq!(queue.num_queued(), 0);
    }

    #[test]
    fn test_shared_budget_across_queues() {
        let first = BroadcastQueue::new("network", 4);
        let second = BroadcastQueue::new("node", 4);
        first.queue_broadcast(table_key("a"), vec![0u8; 50]);
        second.queue_broadcast(table_key("b"), vec![0u8; 50]);
        second.queue_broadcast(table_key("c"), vec![0u8; 50]);

        let msgs = get_broadcasts_from(0, 100, 3, &[&first, &second]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(second.num_queued(), 2);
    }
}
