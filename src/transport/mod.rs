//! Socket plumbing for cluster traffic
//!
//! UDP carries heartbeats and best-effort gossip; TCP carries reliable
//! messages as length-prefixed frames. Receivers hand raw bytes to a channel
//! and never interpret them.
pub mod receiver;
pub mod sender;
pub mod tcp_receiver;

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkDbError, Result};
pub use receiver::UdpReceiver;
pub use sender::FrameSender;
pub use tcp_receiver::TcpReceiver;

/// Largest TCP frame accepted.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Largest UDP datagram read.
pub const UDP_BUFFER_SIZE: usize = 65536;

/// Statistics for a receiver
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub messages_received: AtomicU64,
    pub receive_errors: AtomicU64,
}

impl ReceiverStats {
    pub fn freeze(&self) -> FrozenReceiverStats {
        FrozenReceiverStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrozenReceiverStats {
    pub messages_received: u64,
    pub receive_errors: u64,
}

/// Write one frame: a big-endian `u32` length followed by the data.
pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(crate::transport_error!(
            "Frame too large: {} bytes",
            data.len()
        ));
    }
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkDbError::Io(e)),
    }

    let msg_len = u32::from_be_bytes(len_bytes) as usize;
    if msg_len > MAX_FRAME_SIZE {
        return Err(crate::transport_error!("Message too large: {} bytes", msg_len));
    }

    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len)
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(NetworkDbError::Transport(_))
        ));
    }
}
