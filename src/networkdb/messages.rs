//! NetworkDB wire messages
//!
//! Every message travels as an envelope: a one byte [`MessageType`] tag
//! followed by the bincode encoded payload. A compound envelope batches several
//! envelopes, each prefixed with its length as a big-endian `u16`, so a single
//! datagram can carry many small events.
//!
//! Payloads use bincode's standard config with big-endian integers and a size
//! limit, so a corrupt length field cannot trigger a huge allocation.
use bincode::{Decode, Encode};

use super::clock::LamportTime;
use crate::error::CodecError;

/// Upper bound on any decoded payload.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Bytes added by the compound envelope header (its tag).
pub const COMPOUND_HEADER_OVERHEAD: usize = 1;

/// Bytes added per part inside a compound envelope (its length prefix).
pub const COMPOUND_OVERHEAD: usize = 2;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_limit::<MAX_PAYLOAD_SIZE>()
}

/// Envelope tags. These values are shared by every node in the cluster and
/// must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    NetworkEvent = 1,
    TableEvent = 2,
    PushPull = 3,
    BulkSync = 4,
    Compound = 5,
    NodeEvent = 6,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(MessageType::NetworkEvent),
            2 => Ok(MessageType::TableEvent),
            3 => Ok(MessageType::PushPull),
            4 => Ok(MessageType::BulkSync),
            5 => Ok(MessageType::Compound),
            6 => Ok(MessageType::NodeEvent),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::NetworkEvent => write!(f, "network-event"),
            MessageType::TableEvent => write!(f, "table-event"),
            MessageType::PushPull => write!(f, "push-pull"),
            MessageType::BulkSync => write!(f, "bulk-sync"),
            MessageType::Compound => write!(f, "compound"),
            MessageType::NodeEvent => write!(f, "node-event"),
        }
    }
}

#[derive(Clone, Copy, Debug, Decode, Encode, PartialEq, Eq)]
pub enum NodeEventType {
    /// Node joined the cluster
    Join,
    /// Node gracefully left the cluster
    Leave,
}

/// Cluster-level membership change for a node.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct NodeEvent {
    pub event_type: NodeEventType,
    pub ltime: LamportTime,
    pub node_name: String,
}

#[derive(Clone, Copy, Debug, Decode, Encode, PartialEq, Eq)]
pub enum NetworkEventType {
    Join,
    Leave,
}

/// A node joining or leaving one network.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct NetworkEvent {
    pub event_type: NetworkEventType,
    pub ltime: LamportTime,
    pub node_name: String,
    pub network_id: String,
}

#[derive(Clone, Copy, Debug, Decode, Encode, PartialEq, Eq)]
pub enum TableEventType {
    Create,
    Update,
    Delete,
}

/// A change to one (network, table, key) entry.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct TableEvent {
    pub event_type: TableEventType,
    pub ltime: LamportTime,
    /// Node that owns the entry
    pub node_name: String,
    pub network_id: String,
    pub table_name: String,
    pub key: String,
    pub value: Vec<u8>,
    /// Seconds left before a deleted entry is reaped by its sender
    pub residual_reap_time: u32,
}

/// Point-to-point full table state for a set of networks.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct BulkSyncMessage {
    /// Sender's table clock
    pub ltime: LamportTime,
    /// True when the sender initiated the exchange and expects a reply
    pub unsolicited: bool,
    pub node_name: String,
    pub networks: Vec<String>,
    /// Compound envelope of table events
    pub payload: Vec<u8>,
}

/// One (node, network) membership record inside a push-pull snapshot.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct NetworkEntry {
    pub network_id: String,
    pub ltime: LamportTime,
    pub node_name: String,
    pub leaving: bool,
}

/// Full membership snapshot exchanged by the membership layer's push-pull.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct NetworkPushPull {
    /// Sender's network clock
    pub ltime: LamportTime,
    pub node_name: String,
    pub networks: Vec<NetworkEntry>,
}

/// Encode a payload behind its type tag.
pub fn encode_message<T: Encode>(
    message_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![message_type.as_u8()];
    buf.extend(bincode::encode_to_vec(payload, wire_config())?);
    Ok(buf)
}

/// Wrap already encoded payload bytes behind a type tag.
pub fn encode_raw_message(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(message_type.as_u8());
    buf.extend_from_slice(payload);
    buf
}

/// Split an envelope into its raw tag and payload bytes.
///
/// The tag is returned raw so the dispatcher can report unknown values itself.
pub fn decode_message(buf: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    match buf.split_first() {
        Some((tag, payload)) => Ok((*tag, payload)),
        None => Err(CodecError::Empty),
    }
}

/// Decode a payload produced by [`encode_message`].
pub fn decode_payload<T: Decode<()>>(payload: &[u8]) -> Result<T, CodecError> {
    let (value, _) = bincode::decode_from_slice(payload, wire_config())?;
    Ok(value)
}

/// Decode a full envelope that must carry the given message type.
pub fn decode_typed<T: Decode<()>>(
    expected: MessageType,
    buf: &[u8],
) -> Result<T, CodecError> {
    let (tag, payload) = decode_message(buf)?;
    if tag != expected.as_u8() {
        return Err(CodecError::UnexpectedMessageType {
            expected: expected.as_u8(),
            found: tag,
        });
    }
    decode_payload(payload)
}

/// Batch several envelopes into one compound envelope.
pub fn make_compound_message(msgs: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    let size = msgs.iter().map(|m| m.len() + COMPOUND_OVERHEAD).sum::<usize>();
    let mut buf = Vec::with_capacity(COMPOUND_HEADER_OVERHEAD + size);
    buf.push(MessageType::Compound.as_u8());
    for msg in msgs {
        let len = u16::try_from(msg.len()).map_err(|_| CodecError::MessageTooLarge(msg.len()))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(msg);
    }
    Ok(buf)
}

/// Split the payload of a compound envelope (tag already stripped) into its parts.
pub fn decode_compound_message(payload: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut parts = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < COMPOUND_OVERHEAD {
            return Err(CodecError::Truncated {
                needed: COMPOUND_OVERHEAD,
                remaining: rest.len(),
            });
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[COMPOUND_OVERHEAD..];
        if rest.len() < len {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: rest.len(),
            });
        }
        let (part, tail) = rest.split_at(len);
        parts.push(part);
        rest = tail;
    }
    Ok(parts)
}
