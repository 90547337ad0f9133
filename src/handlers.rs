//! # Network Protocol Handlers
//!
//! Inbound side of the peer protocol. Each request runs on its own task;
//! all shared state is owned by the registry, the key-piece store, and the
//! consensus collaborator, which synchronize themselves.
//!
//! | Request | Effect | Failure |
//! |---------|--------|---------|
//! | `Ping(node)` | Upsert node, forward its address to consensus | never |
//! | `RequestKeyPiece(node, g)` | Read piece held for `node.uuid` at `g` | `NotFound` |
//! | `NewGeneration(node, pw)` | Password gate, then consensus mints `g` | `InvalidArgument`, `Unknown` |
//!
//! `RequestKeyPiece` performs no authorization beyond the transport's TLS
//! policy: any peer that can connect may ask for any UUID's piece.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::crypto::PoolCredential;
use crate::error::Error;
use crate::identity::Node;
use crate::keys::KeyPiece;
use crate::messages::{PeerRequest, PeerResponse, RpcRequest, RpcResponse};
use crate::protocols::{Consensus, RequestHandler};
use crate::registry::NodeRegistry;
use crate::store::KeyPieceStore;

pub struct PeerService {
    registry: Arc<NodeRegistry>,
    key_pieces: Arc<KeyPieceStore>,
    pool: PoolCredential,
    consensus: Option<Arc<dyn Consensus>>,
}

impl PeerService {
    pub fn new(
        registry: Arc<NodeRegistry>,
        key_pieces: Arc<KeyPieceStore>,
        pool: PoolCredential,
        consensus: Option<Arc<dyn Consensus>>,
    ) -> Self {
        Self {
            registry,
            key_pieces,
            pool,
            consensus,
        }
    }

    pub async fn ping(&self, from: Node) {
        debug!(peer = %from, uuid = %from.uuid, "ping received");
        let (uuid, ip, port) = (from.uuid, from.ip.clone(), from.port);
        self.registry.add(from).await;

        if let Some(consensus) = &self.consensus
            && let Err(e) = consensus.change_node_location(uuid, &ip, port).await
        {
            warn!(uuid = %uuid, error = %e, "failed to update node location");
        }
    }

    pub async fn request_key_piece(&self, node: &Node, generation: i64) -> Result<KeyPiece, Error> {
        match self.key_pieces.get_piece(generation, &node.uuid).await {
            Some(piece) => {
                debug!(uuid = %node.uuid, generation, "serving key piece");
                Ok(piece)
            }
            None => Err(Error::not_found(format!(
                "no key piece for {} at generation {}",
                node.uuid, generation
            ))),
        }
    }

    pub async fn new_generation(&self, node: &Node, pool_password: &str) -> Result<(i64, Vec<Node>), Error> {
        // Argon2 is memory and CPU heavy; keep it off the async workers.
        let pool = self.pool.clone();
        let password = pool_password.to_string();
        let verdict = tokio::task::spawn_blocking(move || pool.verify(&password))
            .await
            .map_err(|e| {
                warn!(uuid = %node.uuid, error = %e, "password check task failed");
                Error::unknown("unable to create new generation")
            })?;
        if let Err(e) = verdict {
            warn!(uuid = %node.uuid, peer = %node, "new generation rejected: password check failed");
            return Err(e);
        }

        let Some(consensus) = &self.consensus else {
            warn!(uuid = %node.uuid, "new generation requested with consensus disabled");
            return Err(Error::unknown("unable to create new generation"));
        };

        match consensus.request_new_generation(node.uuid).await {
            Ok((generation, peers)) => {
                info!(uuid = %node.uuid, generation, peers = peers.len(), "new generation created");
                Ok((generation, peers))
            }
            Err(e) => {
                warn!(uuid = %node.uuid, error = %e, "consensus failed to create new generation");
                Err(Error::unknown("unable to create new generation"))
            }
        }
    }
}

#[async_trait]
impl RequestHandler for PeerService {
    async fn handle(&self, request: RpcRequest, remote: SocketAddr) -> RpcResponse {
        let RpcRequest::Peer(request) = request else {
            debug!(remote = %remote, "discovery request sent to peer listener");
            return RpcResponse::Error(Error::invalid_argument("not a peer request"));
        };

        let result = match request {
            PeerRequest::Ping { from } => {
                self.ping(from).await;
                Ok(PeerResponse::Ack)
            }
            PeerRequest::RequestKeyPiece { node, generation } => self
                .request_key_piece(&node, generation)
                .await
                .map(PeerResponse::KeyPiece),
            PeerRequest::NewGeneration { node, pool_password } => self
                .new_generation(&node, &pool_password)
                .await
                .map(|(generation, peers)| PeerResponse::Generation { generation, peers }),
        };

        match result {
            Ok(response) => RpcResponse::Peer(response),
            Err(e) => RpcResponse::Error(e),
        }
    }
}
