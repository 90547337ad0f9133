//! Protocol and collaborator trait definitions.
//!
//! | Seam | Trait | Implemented by |
//! |------|-------|----------------|
//! | Peer protocol, client side | [`PeerRpc`] | `PeerTransport` |
//! | Inbound request dispatch | [`RequestHandler`] | `PeerService`, test doubles |
//! | Replicated consensus layer | [`Consensus`] | external, `LocalMembership` |
//! | Router port forwarding | [`PortMapper`] | external |
//!
//! ## Design
//!
//! The consensus layer and port mapper live outside this crate. The daemon
//! only depends on the contracts below, which keeps handlers testable
//! against in-process doubles.

use std::net::SocketAddr;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Error;
use crate::identity::Node;
use crate::keys::KeyPiece;
use crate::messages::{RpcRequest, RpcResponse};

/// Client side of the peer protocol.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Announce ourselves to `to` and check it is alive.
    async fn ping(&self, to: &Node) -> Result<(), Error>;

    /// Ask `to` for the piece it holds on our behalf at `generation`.
    async fn request_key_piece(&self, to: &Node, generation: i64) -> Result<KeyPiece, Error>;

    /// Ask `to` to mint a new generation for us.
    async fn new_generation(&self, to: &Node, pool_password: &str) -> Result<(i64, Vec<Node>), Error>;
}

/// Server side dispatch for one decoded request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest, remote: SocketAddr) -> RpcResponse;
}

/// Role of this node in the replicated consensus group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusRole {
    Follower,
    Candidate,
    Leader,
    Inactive,
}

impl std::fmt::Display for ConsensusRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsensusRole::Follower => "Follower",
            ConsensusRole::Candidate => "Candidate",
            ConsensusRole::Leader => "Leader",
            ConsensusRole::Inactive => "Raft Inactive",
        };
        f.write_str(name)
    }
}

/// Operations the daemon needs from the replicated consensus layer.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Mint a new generation for `uuid`, returning its number and the peers
    /// that take part in the key-share round.
    async fn request_new_generation(&self, uuid: Uuid) -> anyhow::Result<(i64, Vec<Node>)>;

    /// Record that `uuid` is now reachable at `ip:port`.
    async fn change_node_location(&self, uuid: Uuid, ip: &str, port: u16) -> anyhow::Result<()>;

    fn role(&self) -> ConsensusRole;

    /// Current members of the consensus group.
    async fn peers(&self) -> Vec<Node>;
}

/// External port-forwarding reservation (UPnP or similar).
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn clear_port_mapping(&self, port: u16) -> anyhow::Result<()>;
}
