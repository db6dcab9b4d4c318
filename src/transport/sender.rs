//! Outbound sockets
//!
//! One UDP socket for datagrams and a pool of TCP connections keyed by peer
//! address. A broken connection is dropped and redialed once.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use super::write_frame;
use crate::error::{NetworkDbError, Result};

/// Statistics for outbound traffic
#[derive(Debug, Default)]
pub struct SenderStats {
    pub open_connections: AtomicUsize,
    pub messages_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

pub struct FrameSender {
    udp: UdpSocket,
    connections: Mutex<IndexMap<SocketAddr, TcpStream>>,
    stats: Arc<SenderStats>,
}

impl FrameSender {
    pub async fn new(bind_ip: std::net::IpAddr) -> Result<Self> {
        let udp = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;
        Ok(Self {
            udp,
            connections: Mutex::new(IndexMap::new()),
            stats: Arc::new(SenderStats::default()),
        })
    }

    /// Send one datagram.
    pub async fn send_datagram(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        match self.udp.send_to(data, target).await {
            Ok(_) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(NetworkDbError::Io(e))
            }
        }
    }

    /// Send one frame over a pooled connection.
    pub async fn send_frame(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        let mut connections = self.connections.lock().await;

        if let Some(stream) = connections.get_mut(&target) {
            match write_frame(stream, data).await {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Dropping broken connection to {}: {}", target, e);
                    connections.shift_remove(&target);
                }
            }
        }

        let mut stream = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .open_connections
                    .store(connections.len(), Ordering::Relaxed);
                return Err(crate::transport_error!("Connect to {} failed: {}", target, e));
            }
        };
        if let Err(e) = write_frame(&mut stream, data).await {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        connections.insert(target, stream);
        self.stats
            .open_connections
            .store(connections.len(), Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::super::TcpReceiver;
    use super::*;

    #[tokio::test]
    async fn test_frames_reuse_connection() {
        let receiver = TcpReceiver::new("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = receiver.start(tx);

        let sender = FrameSender::new("127.0.0.1".parse().unwrap()).await.unwrap();
        sender.send_frame(receiver.local_addr, b"a").await.unwrap();
        sender.send_frame(receiver.local_addr, b"b").await.unwrap();

        for expected in [&b"a"[..], &b"b"[..]] {
            let (data, _) = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&data[..], expected);
        }
        let stats = sender.stats();
        assert_eq!(stats.open_connections.load(Ordering::Relaxed), 1);
        assert_eq!(stats.messages_sent.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let sender = FrameSender::new("127.0.0.1".parse().unwrap()).await.unwrap();
        // Bind then drop to get a port nobody listens on
        let unused = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(matches!(
            sender.send_frame(unused, b"x").await,
            Err(NetworkDbError::Transport(_))
        ));
    }
}
