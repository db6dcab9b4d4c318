//! UDP Receiver
//!
//! Reads datagrams and forwards them with their source address.
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{FrozenReceiverStats, ReceiverStats, UDP_BUFFER_SIZE};
use crate::error::Result;

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    stats: Arc<ReceiverStats>,
}

impl UdpReceiver {
    /// Create a new UDP receiver
    pub async fn new(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            stats: Arc::new(ReceiverStats::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the receive loop. It ends once `message_tx` is closed.
    pub fn start(&self, message_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let stats = Arc::clone(&self.stats);
        let local_addr = self.local_addr;

        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        if message_tx
                            .send((Bytes::copy_from_slice(&buf[..len]), addr))
                            .is_err()
                        {
                            debug!("[{}] UDP receiver channel closed, exiting", local_addr);
                            return;
                        }
                    }
                    Err(e) => {
                        stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("[{}] UDP receive error: {}", local_addr, e);
                    }
                }
            }
        })
    }

    pub fn get_stats(&self) -> FrozenReceiverStats {
        self.stats.freeze()
    }
}
