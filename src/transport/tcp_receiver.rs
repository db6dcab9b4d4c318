//! TCP Receiver
//!
//! Accepts connections and forwards every length-prefixed frame read from them.
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{read_frame, FrozenReceiverStats, ReceiverStats};
use crate::error::Result;

pub struct TcpReceiver {
    pub local_addr: SocketAddr,
    socket: Arc<TcpListener>,
    stats: Arc<ReceiverStats>,
}

impl TcpReceiver {
    /// Create a new TCP receiver
    pub async fn new(bind_addr: SocketAddr) -> Result<Self> {
        let socket = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;

        Ok(Self {
            local_addr,
            socket: Arc::new(socket),
            stats: Arc::new(ReceiverStats::default()),
        })
    }

    /// Spawn the accept loop; each connection gets its own reader task.
    pub fn start(&self, message_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let stats = Arc::clone(&self.stats);
        let local_addr = self.local_addr;

        tokio::spawn(async move {
            loop {
                let (mut stream, peer_addr) = match socket.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("[{}] TCP accept failed: {}", local_addr, e);
                        continue;
                    }
                };
                if message_tx.is_closed() {
                    return;
                }

                let tx = message_tx.clone();
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    loop {
                        match read_frame(&mut stream).await {
                            Ok(Some(buf)) => {
                                stats.messages_received.fetch_add(1, Ordering::Relaxed);
                                if tx.send((Bytes::from(buf), peer_addr)).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => return,
                            Err(e) => {
                                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                                debug!("[{}] Failed to read frame from {}: {}", local_addr, peer_addr, e);
                                return;
                            }
                        }
                    }
                });
            }
        })
    }

    pub fn get_stats(&self) -> FrozenReceiverStats {
        self.stats.freeze()
    }
}
