//! Static-topology membership layer
//!
//! A small stand-in for a full failure detector: every member heartbeats the
//! configured topology over UDP, peers that go quiet for the failure timeout
//! are reported failed, and store traffic is carried as UDP gossip or TCP
//! frames. All socket work happens on one loop task; the store reaches it
//! through [`ClusterSender`].
pub mod membership;
pub mod messages;
pub mod peer_sender;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::networkdb::messages::{make_compound_message, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD};
use crate::networkdb::{Delegate, EventDelegate, Node};
use crate::settings::ClusterConfig;
use crate::transport::{FrameSender, TcpReceiver, UdpReceiver};

pub use membership::{AliveChange, PeerTable};
pub use messages::ClusterFrame;
pub use peer_sender::{ClusterSender, Outbound};

/// Room left in a datagram for the frame around a gossip payload.
const FRAME_OVERHEAD: usize = 64;

/// Metadata budget offered to the delegate for heartbeats.
const META_LIMIT: usize = 512;

/// Membership layer before it has been started.
pub struct StaticCluster {
    config: ClusterConfig,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Running membership layer.
pub struct ClusterHandle {
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterHandle {
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ClusterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StaticCluster {
    /// Create the cluster and the sender the store will use. The sender
    /// queues until `start` runs the loop.
    pub fn new(config: ClusterConfig) -> (Self, ClusterSender) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let sender = ClusterSender::new(config.node_name.clone(), outbound_tx.clone());
        (
            Self {
                config,
                outbound_tx,
                outbound_rx,
            },
            sender,
        )
    }

    /// Bind UDP and TCP on the same port and spawn the cluster loop.
    pub async fn start<D>(self, delegate: Arc<D>) -> Result<ClusterHandle>
    where
        D: Delegate + EventDelegate + 'static,
    {
        let udp = UdpReceiver::new(self.config.bind_addr).await?;
        let local_addr = udp.local_addr();
        let tcp = TcpReceiver::new(local_addr).await?;
        let sender = Arc::new(FrameSender::new(local_addr.ip()).await?);

        let mut config = self.config;
        if config.advertise_addr.port() == 0 {
            config.advertise_addr = SocketAddr::new(config.advertise_addr.ip(), local_addr.port());
        }
        info!(
            "[{}] Cluster listening on {} (advertising {}) with {} configured peers",
            config.node_name,
            local_addr,
            config.advertise_addr,
            config.topology.len()
        );

        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let mut tasks = vec![udp.start(udp_tx), tcp.start(tcp_tx)];

        let cluster_loop = ClusterLoop {
            config,
            delegate,
            peers: PeerTable::new(),
            sender,
            outbound_tx: self.outbound_tx,
        };
        tasks.push(tokio::spawn(cluster_loop.run(
            udp_rx,
            tcp_rx,
            self.outbound_rx,
        )));

        Ok(ClusterHandle { local_addr, tasks })
    }
}

struct ClusterLoop<D> {
    config: ClusterConfig,
    delegate: Arc<D>,
    peers: PeerTable,
    sender: Arc<FrameSender>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl<D> ClusterLoop<D>
where
    D: Delegate + EventDelegate + 'static,
{
    fn node_name(&self) -> &str {
        &self.config.node_name
    }

    async fn run(
        mut self,
        mut udp_rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
        mut tcp_rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut alive_timer = time::interval(self.config.alive_interval);
        let mut gossip_timer = time::interval(self.config.gossip_interval);
        let mut push_pull_timer = time::interval(self.config.push_pull_interval);

        loop {
            tokio::select! {
                Some((data, addr)) = udp_rx.recv() => self.handle_frame(&data, addr),
                Some((data, addr)) = tcp_rx.recv() => self.handle_frame(&data, addr),
                Some(outbound) = outbound_rx.recv() => self.dispatch(outbound).await,
                _ = alive_timer.tick() => {
                    self.send_alive().await;
                    self.check_failures();
                }
                _ = gossip_timer.tick() => self.gossip().await,
                _ = push_pull_timer.tick() => self.push_pull(),
                else => {
                    info!("[{}] Cluster loop channels closed, exiting", self.node_name());
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, data: &[u8], source: SocketAddr) {
        let frame = match ClusterFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[{}] Bad cluster frame from {}: {}", self.node_name(), source, e);
                return;
            }
        };

        match frame {
            ClusterFrame::Alive { name, addr, .. } => {
                if name == self.config.node_name {
                    return;
                }
                match self.peers.record_alive(&name, addr, Instant::now()) {
                    AliveChange::Joined => {
                        self.delegate.notify_join(Node::new(name.clone(), addr));
                        // Exchange state right away rather than waiting a full interval
                        self.send_push_pull(&name, addr, true, false);
                    }
                    AliveChange::Moved => self.delegate.notify_update(Node::new(name, addr)),
                    AliveChange::Unchanged => {}
                }
            }
            ClusterFrame::Gossip { payload, .. } | ClusterFrame::Message { payload, .. } => {
                self.delegate.notify_msg(&payload);
            }
            ClusterFrame::PushPull {
                from,
                addr,
                join,
                reply,
                state,
            } => {
                self.delegate.merge_remote_state(&state, join);
                self.peers.mark_synced(&from);
                if !reply {
                    self.send_push_pull(&from, addr, join, true);
                }
            }
        }
    }

    fn send_push_pull(&self, name: &str, target: SocketAddr, join: bool, reply: bool) {
        debug!(
            "[{}] Push-pull with {} (join={}, reply={})",
            self.node_name(),
            name,
            join,
            reply
        );
        let frame = ClusterFrame::PushPull {
            from: self.config.node_name.clone(),
            addr: self.config.advertise_addr,
            join,
            reply,
            state: self.delegate.local_state(join),
        };
        if self
            .outbound_tx
            .send(Outbound::Stream { target, frame })
            .is_err()
        {
            debug!("[{}] Outbound queue closed", self.node_name());
        }
    }

    async fn dispatch(&self, outbound: Outbound) {
        match outbound {
            Outbound::Datagram { target, frame } => {
                let buf = match frame.encode() {
                    Ok(buf) => buf,
                    Err(e) => {
                        warn!("[{}] Failed to encode frame: {}", self.node_name(), e);
                        return;
                    }
                };
                if let Err(e) = self.sender.send_datagram(target, &buf).await {
                    debug!("[{}] Datagram to {} failed: {}", self.node_name(), target, e);
                }
            }
            Outbound::Stream { target, frame } => {
                let buf = match frame.encode() {
                    Ok(buf) => buf,
                    Err(e) => {
                        warn!("[{}] Failed to encode frame: {}", self.node_name(), e);
                        return;
                    }
                };
                // Connects may stall; keep the loop responsive
                let sender = Arc::clone(&self.sender);
                let node_name = self.config.node_name.clone();
                tokio::spawn(async move {
                    if let Err(e) = sender.send_frame(target, &buf).await {
                        debug!("[{}] Stream to {} failed: {}", node_name, target, e);
                    }
                });
            }
        }
    }

    async fn send_alive(&self) {
        let frame = ClusterFrame::Alive {
            name: self.config.node_name.clone(),
            addr: self.config.advertise_addr,
            meta: self.delegate.node_meta(META_LIMIT),
        };
        let buf = match frame.encode() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("[{}] Failed to encode heartbeat: {}", self.node_name(), e);
                return;
            }
        };
        for target in &self.config.topology {
            if let Err(e) = self.sender.send_datagram(*target, &buf).await {
                debug!("[{}] Heartbeat to {} failed: {}", self.node_name(), target, e);
            }
        }
    }

    fn check_failures(&mut self) {
        for name in self.peers.expire(Instant::now(), self.config.failure_timeout) {
            warn!(
                "[{}] Peer {} silent for {:?}, marking failed",
                self.node_name(),
                name,
                self.config.failure_timeout
            );
            self.delegate.notify_leave(&name);
        }
    }

    async fn gossip(&self) {
        if self.peers.num_alive() == 0 {
            return;
        }
        let limit = self
            .config
            .packet_buffer_size
            .saturating_sub(COMPOUND_HEADER_OVERHEAD + FRAME_OVERHEAD);
        let msgs = self.delegate.get_broadcasts(COMPOUND_OVERHEAD, limit);
        if msgs.is_empty() {
            return;
        }
        let payload = match make_compound_message(&msgs) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[{}] Failed to batch broadcasts: {}", self.node_name(), e);
                return;
            }
        };
        for (_, addr) in self.peers.random_alive(self.config.gossip_fanout) {
            self.dispatch(Outbound::Datagram {
                target: addr,
                frame: ClusterFrame::Gossip {
                    from: self.config.node_name.clone(),
                    payload: payload.clone(),
                },
            })
            .await;
        }
    }

    fn push_pull(&mut self) {
        let Some((name, addr)) = self.peers.random_alive(1).pop() else {
            return;
        };
        let join = !self.peers.is_synced(&name);
        self.send_push_pull(&name, addr, join, false);
    }
}
