use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Main error type for the NetworkDB service
///
/// Only driver-facing operations surface these. The gossip receive path logs
/// and drops instead of returning errors.
#[derive(Debug)]
pub enum NetworkDbError {
    /// Configuration or CLI argument errors
    Config(String),

    /// The local node already belongs to this network
    NetworkAlreadyJoined(String),

    /// The local node does not belong to this network
    NetworkNotFound(String),

    /// A live entry already exists for this table/network/key
    EntryExists {
        table: String,
        network_id: String,
        key: String,
    },

    /// No live entry exists for this table/network/key
    EntryNotFound {
        table: String,
        network_id: String,
        key: String,
    },

    /// Peer node unknown to the membership layer
    NodeNotFound(String),

    /// Waiting on a peer response exceeded its deadline
    Timeout(String),

    /// Wire encoding/decoding errors
    Codec(CodecError),

    /// Transport layer errors
    Transport(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Internal lock poisoning or concurrency errors
    Concurrency(String),
}

/// Wire codec errors
#[derive(Debug)]
pub enum CodecError {
    /// Zero-length envelope
    Empty,

    /// Envelope tag is not one of the known message types
    UnknownMessageType(u8),

    /// Expected a particular envelope type but found another
    UnexpectedMessageType { expected: u8, found: u8 },

    /// Compound envelope ended mid-part
    Truncated { needed: usize, remaining: usize },

    /// Sub-envelope does not fit the compound length prefix
    MessageTooLarge(usize),

    /// Binary encoding errors
    Encode(bincode::error::EncodeError),

    /// Binary decoding errors
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for NetworkDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkDbError::Config(msg) => write!(f, "Configuration error: {}", msg),
            NetworkDbError::NetworkAlreadyJoined(nid) => {
                write!(f, "Network {} is already joined", nid)
            }
            NetworkDbError::NetworkNotFound(nid) => write!(f, "Network {} not found", nid),
            NetworkDbError::EntryExists {
                table,
                network_id,
                key,
            } => write!(
                f,
                "Entry in table {} with network id {} and key {} already exists",
                table, network_id, key
            ),
            NetworkDbError::EntryNotFound {
                table,
                network_id,
                key,
            } => write!(
                f,
                "Entry in table {} with network id {} and key {} does not exist",
                table, network_id, key
            ),
            NetworkDbError::NodeNotFound(name) => write!(f, "Node {} not found", name),
            NetworkDbError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            NetworkDbError::Codec(err) => write!(f, "Codec error: {}", err),
            NetworkDbError::Transport(msg) => write!(f, "Transport error: {}", msg),
            NetworkDbError::Io(err) => write!(f, "I/O error: {}", err),
            NetworkDbError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty message"),
            CodecError::UnknownMessageType(tag) => write!(f, "unknown message type {}", tag),
            CodecError::UnexpectedMessageType { expected, found } => write!(
                f,
                "unexpected message type {} (expected {})",
                found, expected
            ),
            CodecError::Truncated { needed, remaining } => write!(
                f,
                "truncated compound message: need {} bytes, {} remaining",
                needed, remaining
            ),
            CodecError::MessageTooLarge(len) => {
                write!(f, "message of {} bytes exceeds compound part limit", len)
            }
            CodecError::Encode(err) => write!(f, "encode: {}", err),
            CodecError::Decode(err) => write!(f, "decode: {}", err),
        }
    }
}

impl std::error::Error for NetworkDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkDbError::Io(err) => Some(err),
            NetworkDbError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(err) => Some(err),
            CodecError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, NetworkDbError>;

impl NetworkDbError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NetworkDbError::Config(_) => StatusCode::BAD_REQUEST,
            NetworkDbError::NetworkAlreadyJoined(_) => StatusCode::CONFLICT,
            NetworkDbError::NetworkNotFound(_) => StatusCode::NOT_FOUND,
            NetworkDbError::EntryExists { .. } => StatusCode::CONFLICT,
            NetworkDbError::EntryNotFound { .. } => StatusCode::NOT_FOUND,
            NetworkDbError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            NetworkDbError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            NetworkDbError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NetworkDbError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            NetworkDbError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NetworkDbError::Concurrency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            NetworkDbError::Config(_) => "configuration_error",
            NetworkDbError::NetworkAlreadyJoined(_) => "network_already_joined",
            NetworkDbError::NetworkNotFound(_) => "network_not_found",
            NetworkDbError::EntryExists { .. } => "entry_exists",
            NetworkDbError::EntryNotFound { .. } => "entry_not_found",
            NetworkDbError::NodeNotFound(_) => "node_not_found",
            NetworkDbError::Timeout(_) => "timeout",
            NetworkDbError::Codec(_) => "codec_error",
            NetworkDbError::Transport(_) => "transport_error",
            NetworkDbError::Io(_) => "io_error",
            NetworkDbError::Concurrency(_) => "concurrency_error",
        }
    }
}

// Axum IntoResponse implementation for HTTP error responses
impl IntoResponse for NetworkDbError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Conversions from common error types
impl From<std::io::Error> for NetworkDbError {
    fn from(err: std::io::Error) -> Self {
        NetworkDbError::Io(err)
    }
}

impl From<CodecError> for NetworkDbError {
    fn from(err: CodecError) -> Self {
        NetworkDbError::Codec(err)
    }
}

impl From<bincode::error::EncodeError> for CodecError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CodecError::Encode(err)
    }
}

impl From<bincode::error::DecodeError> for CodecError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CodecError::Decode(err)
    }
}

impl From<bincode::error::EncodeError> for NetworkDbError {
    fn from(err: bincode::error::EncodeError) -> Self {
        NetworkDbError::Codec(CodecError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for NetworkDbError {
    fn from(err: bincode::error::DecodeError) -> Self {
        NetworkDbError::Codec(CodecError::Decode(err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::NetworkDbError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NetworkDbError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::NetworkDbError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NetworkDbError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! concurrency_error {
    ($msg:expr) => {
        $crate::error::NetworkDbError::Concurrency($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NetworkDbError::Concurrency(format!($fmt, $($arg)*))
    };
}
