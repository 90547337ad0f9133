//! # Wire Protocol Messages
//!
//! Serializable message types for the three protocols the daemon speaks,
//! and the length-prefixed framing they share.
//!
//! | Protocol | Request Type | Response Type | Carrier |
//! |----------|--------------|---------------|---------|
//! | Peer | `PeerRequest` | `PeerResponse` | QUIC bidi stream |
//! | Discovery | `DiscoveryRequest` | `DiscoveryResponse` | QUIC bidi stream |
//! | Intercom | `IntercomRequest` | `IntercomResponse` | Unix socket |
//!
//! ## Framing
//!
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ len: u32 BE  │ bincode body (len bytes) │
//! └──────────────┴──────────────────────────┘
//! ```
//!
//! Frames larger than the caller's bound are refused before allocation and
//! all decoding goes through [`decode`], which enforces a size limit.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::identity::Node;
use crate::keys::KeyPiece;

/// Maximum accepted request frame (64 KiB).
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum accepted response frame (1 MiB).
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Longest pool password accepted in a request.
pub const MAX_PASSWORD_LEN: usize = 1024;

/// Longest pool name accepted in a discovery request.
pub const MAX_POOL_NAME_LEN: usize = 256;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_RESPONSE_SIZE as u64)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Read one length-prefixed frame, refusing frames over `max` bytes with
/// `ErrorKind::InvalidData`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

// ============================================================================
// QUIC RPC envelope
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Peer(PeerRequest),
    Discovery(DiscoveryRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Peer(PeerResponse),
    Discovery(DiscoveryResponse),
    Error(Error),
}

impl RpcRequest {
    /// Node the caller claims to be, when the request carries one.
    pub fn sender(&self) -> Option<&Node> {
        match self {
            RpcRequest::Peer(PeerRequest::Ping { from }) => Some(from),
            RpcRequest::Peer(PeerRequest::RequestKeyPiece { node, .. }) => Some(node),
            RpcRequest::Peer(PeerRequest::NewGeneration { node, .. }) => Some(node),
            RpcRequest::Discovery(DiscoveryRequest::Join { node, .. }) => Some(node),
            RpcRequest::Discovery(DiscoveryRequest::Renew { node, .. }) => Some(node),
            RpcRequest::Discovery(DiscoveryRequest::Disconnect { node }) => Some(node),
        }
    }

    /// Structural checks applied before any handler runs.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(node) = self.sender() {
            node.validate()?;
        }
        match self {
            RpcRequest::Peer(PeerRequest::NewGeneration { pool_password, .. })
                if pool_password.len() > MAX_PASSWORD_LEN =>
            {
                Err(Error::invalid_argument("pool password too long"))
            }
            RpcRequest::Discovery(
                DiscoveryRequest::Join { pool, .. } | DiscoveryRequest::Renew { pool, .. },
            ) if pool.is_empty() || pool.len() > MAX_POOL_NAME_LEN => {
                Err(Error::invalid_argument("pool name is empty or too long"))
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Peer protocol
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    Ping {
        from: Node,
    },
    RequestKeyPiece {
        node: Node,
        generation: i64,
    },
    NewGeneration {
        node: Node,
        pool_password: String,
    },
}

impl std::fmt::Debug for PeerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRequest::Ping { from } => f.debug_struct("Ping").field("from", from).finish(),
            PeerRequest::RequestKeyPiece { node, generation } => f
                .debug_struct("RequestKeyPiece")
                .field("node", node)
                .field("generation", generation)
                .finish(),
            PeerRequest::NewGeneration { node, .. } => f
                .debug_struct("NewGeneration")
                .field("node", node)
                .field("pool_password", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    Ack,
    KeyPiece(KeyPiece),
    Generation { generation: i64, peers: Vec<Node> },
}

// ============================================================================
// Discovery protocol
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiscoveryRequest {
    Join { pool: String, node: Node },
    Renew { pool: String, node: Node },
    Disconnect { node: Node },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryResponse {
    /// Pool membership granted. `renew_interval_ms` is the lease period the
    /// service expects renewals within.
    Joined {
        renew_interval_ms: u64,
        peers: Vec<Node>,
    },
    Ack,
}

// ============================================================================
// Intercom (local operator interface)
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntercomRequest {
    ConfirmUp,
    Status,
    ListNodes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub status: String,
    pub tls_active: bool,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntercomResponse {
    Up,
    Status(StatusReport),
    Nodes(Vec<Node>),
    Error(Error),
}
