use std::net::SocketAddr;

use bincode::{Decode, Encode};

use crate::error::CodecError;

/// Frames exchanged by the membership layer itself.
///
/// Store payloads ride inside `Gossip` and `Message` untouched.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum ClusterFrame {
    /// Heartbeat announcing a live member
    Alive {
        name: String,
        addr: SocketAddr,
        meta: Vec<u8>,
    },
    /// Best-effort store payload (UDP)
    Gossip { from: String, payload: Vec<u8> },
    /// Reliable store payload (TCP)
    Message { from: String, payload: Vec<u8> },
    /// Full state exchange (TCP)
    PushPull {
        from: String,
        addr: SocketAddr,
        join: bool,
        reply: bool,
        state: Vec<u8>,
    },
}

impl ClusterFrame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let (frame, _) = bincode::decode_from_slice(buf, bincode::config::standard())?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pull_frame() {
        let frame = ClusterFrame::PushPull {
            from: "node-a".to_string(),
            addr: "10.0.0.1:7946".parse().unwrap(),
            join: true,
            reply: false,
            state: vec![3, 1, 2],
        };
        let decoded = ClusterFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ClusterFrame::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(ClusterFrame::decode(&[]).is_err());
    }
}
