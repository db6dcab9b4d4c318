//! Shared harness: an in-memory cluster where every store sends through one
//! ordered channel and a pump task delivers to the addressed store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use networkdb::error::Result;
use networkdb::networkdb::messages::{
    make_compound_message, NetworkEvent, NetworkEventType, COMPOUND_HEADER_OVERHEAD,
    COMPOUND_OVERHEAD,
};
use networkdb::networkdb::{
    ClusterTransport, Delegate, EventDelegate, LamportTime, NetworkDb, Node,
};
use networkdb::settings::NetworkDbConfig;

pub const PACKET_SIZE: usize = 1400;

pub fn addr(index: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, (index + 1) as u8], 7946))
}

#[derive(Debug)]
struct Envelope {
    to: String,
    payload: Vec<u8>,
}

/// Transport that hands every send to the shared pump.
struct MemTransport {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ClusterTransport for MemTransport {
    fn send_best_effort(&self, node: &Node, msg: Vec<u8>) -> Result<()> {
        self.tx
            .send(Envelope {
                to: node.name.clone(),
                payload: msg,
            })
            .map_err(|_| networkdb::transport_error!("pump stopped"))
    }

    fn send_reliable(&self, node: &Node, msg: Vec<u8>) -> Result<()> {
        self.send_best_effort(node, msg)
    }
}

pub struct TestCluster {
    pub nodes: Vec<Arc<NetworkDb>>,
    /// Names whose inbound traffic is dropped
    isolated: Arc<Mutex<Vec<String>>>,
    pump: JoinHandle<()>,
}

impl TestCluster {
    /// `size` stores that all know each other but share no networks yet.
    pub fn new(size: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let mut config = NetworkDbConfig::new(format!("node-{}", i), addr(i));
            config.bulk_sync_timeout = Duration::from_secs(2);
            let transport = Arc::new(MemTransport { tx: tx.clone() });
            nodes.push(Arc::new(NetworkDb::new(config, transport).unwrap()));
        }

        for (i, db) in nodes.iter().enumerate() {
            for (j, other) in nodes.iter().enumerate() {
                if i != j {
                    db.notify_join(Node::new(other.node_name(), addr(j)));
                }
            }
        }

        let registry: HashMap<String, Arc<NetworkDb>> = nodes
            .iter()
            .map(|db| (db.node_name().to_string(), Arc::clone(db)))
            .collect();
        let isolated = Arc::new(Mutex::new(Vec::<String>::new()));
        let pump_isolated = Arc::clone(&isolated);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if pump_isolated.lock().unwrap().contains(&envelope.to) {
                    continue;
                }
                if let Some(db) = registry.get(&envelope.to) {
                    db.notify_msg(&envelope.payload);
                }
            }
        });

        Self {
            nodes,
            isolated,
            pump,
        }
    }

    pub fn node(&self, index: usize) -> &Arc<NetworkDb> {
        &self.nodes[index]
    }

    /// Drop everything addressed to `index` until `heal`.
    pub fn isolate(&self, index: usize) {
        let name = self.nodes[index].node_name().to_string();
        self.isolated.lock().unwrap().push(name);
    }

    pub fn heal(&self) {
        self.isolated.lock().unwrap().clear();
    }

    /// One gossip round: membership-layer broadcasts go to every other node,
    /// then each store runs its own table gossip.
    pub async fn gossip_round(&self) {
        for (i, db) in self.nodes.iter().enumerate() {
            let msgs = db.get_broadcasts(COMPOUND_OVERHEAD, PACKET_SIZE - COMPOUND_HEADER_OVERHEAD);
            if !msgs.is_empty() {
                let compound = make_compound_message(&msgs).unwrap();
                for (j, other) in self.nodes.iter().enumerate() {
                    if i != j && !self.isolated.lock().unwrap().contains(&other.node_name().to_string()) {
                        other.notify_msg(&compound);
                    }
                }
            }
            db.gossip();
        }
        self.settle().await;
    }

    pub async fn gossip_rounds(&self, rounds: usize) {
        for _ in 0..rounds {
            self.gossip_round().await;
        }
    }

    /// Let the pump drain.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// Join every node to `network_id`, one at a time, gossiping in between.
    pub async fn join_all(&self, network_id: &str) {
        for db in &self.nodes {
            db.join_network(network_id).await.unwrap();
            self.gossip_rounds(2).await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// A lone store joined to `network_id` that also knows `member` as a member of it.
pub async fn db_with_member(network_id: &str, member: &str) -> Arc<NetworkDb> {
    let transport = Arc::new(NullTransport);
    let db = Arc::new(NetworkDb::new(NetworkDbConfig::new("local", addr(0)), transport).unwrap());
    db.notify_join(Node::new(member, addr(1)));
    db.join_network(network_id).await.unwrap();
    assert!(db.handle_network_event(&NetworkEvent {
        event_type: NetworkEventType::Join,
        ltime: LamportTime(1),
        node_name: member.to_string(),
        network_id: network_id.to_string(),
    }));
    db
}

/// Transport that discards everything.
pub struct NullTransport;

impl ClusterTransport for NullTransport {
    fn send_best_effort(&self, _node: &Node, _msg: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn send_reliable(&self, _node: &Node, _msg: Vec<u8>) -> Result<()> {
        Ok(())
    }
}
