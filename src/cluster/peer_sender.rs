use std::net::SocketAddr;

use tokio::sync::mpsc;

use super::messages::ClusterFrame;
use crate::error::Result;
use crate::networkdb::{ClusterTransport, Node};

/// A frame waiting to leave the node.
#[derive(Debug)]
pub enum Outbound {
    Datagram { target: SocketAddr, frame: ClusterFrame },
    Stream { target: SocketAddr, frame: ClusterFrame },
}

/// Store-facing half of the cluster: enqueues frames for the cluster loop.
#[derive(Clone, Debug)]
pub struct ClusterSender {
    node_name: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClusterSender {
    pub fn new(node_name: impl Into<String>, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            node_name: node_name.into(),
            tx,
        }
    }

    fn enqueue(&self, outbound: Outbound) -> Result<()> {
        self.tx
            .send(outbound)
            .map_err(|_| crate::transport_error!("[{}] Cluster loop has stopped", self.node_name))
    }
}

impl ClusterTransport for ClusterSender {
    fn send_best_effort(&self, node: &Node, msg: Vec<u8>) -> Result<()> {
        self.enqueue(Outbound::Datagram {
            target: node.addr,
            frame: ClusterFrame::Gossip {
                from: self.node_name.clone(),
                payload: msg,
            },
        })
    }

    fn send_reliable(&self, node: &Node, msg: Vec<u8>) -> Result<()> {
        self.enqueue(Outbound::Stream {
            target: node.addr,
            frame: ClusterFrame::Message {
                from: self.node_name.clone(),
                payload: msg,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sends_are_enqueued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = ClusterSender::new("node-a", tx);
        let node = Node::new("node-b", "10.0.0.2:7946".parse().unwrap());

        sender.send_best_effort(&node, vec![1]).unwrap();
        sender.send_reliable(&node, vec![2]).unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Datagram { frame: ClusterFrame::Gossip { .. }, .. }
        ));
        match rx.try_recv().unwrap() {
            Outbound::Stream { target, frame } => {
                assert_eq!(target, node.addr);
                assert_eq!(
                    frame,
                    ClusterFrame::Message {
                        from: "node-a".to_string(),
                        payload: vec![2]
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closed_loop_is_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = ClusterSender::new("node-a", tx);
        let node = Node::new("node-b", "10.0.0.2:7946".parse().unwrap());
        assert!(sender.send_reliable(&node, vec![1]).is_err());
    }
}
