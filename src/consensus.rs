//! Stand-in consensus collaborator used when no replicated layer is attached.
//!
//! `LocalMembership` mints strictly increasing generation numbers, starting
//! after the highest generation already present in the key-piece store, and
//! reports the registry's nodes as the peer list. Address changes are
//! accepted and only logged, since the registry already holds them.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::identity::Node;
use crate::protocols::{Consensus, ConsensusRole};
use crate::registry::NodeRegistry;

pub struct LocalMembership {
    registry: Arc<NodeRegistry>,
    last_generation: AtomicI64,
}

impl LocalMembership {
    /// `last_generation` is the newest generation already in use, or 0.
    pub fn new(registry: Arc<NodeRegistry>, last_generation: i64) -> Self {
        Self {
            registry,
            last_generation: AtomicI64::new(last_generation.max(0)),
        }
    }

    pub fn last_generation(&self) -> i64 {
        self.last_generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consensus for LocalMembership {
    async fn request_new_generation(&self, uuid: Uuid) -> anyhow::Result<(i64, Vec<Node>)> {
        let generation = self.last_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let peers = self.registry.get_all().await;
        info!(generation, requester = %uuid, peers = peers.len(), "minted new generation");
        Ok((generation, peers))
    }

    async fn change_node_location(&self, uuid: Uuid, ip: &str, port: u16) -> anyhow::Result<()> {
        debug!(uuid = %uuid, ip, port, "node location changed");
        Ok(())
    }

    fn role(&self) -> ConsensusRole {
        ConsensusRole::Inactive
    }

    async fn peers(&self) -> Vec<Node> {
        self.registry.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generations_increase_from_last_used() {
        let registry = Arc::new(NodeRegistry::new());
        let membership = LocalMembership::new(registry, 3);

        let (first, _) = membership.request_new_generation(Uuid::new_v4()).await.unwrap();
        let (second, _) = membership.request_new_generation(Uuid::new_v4()).await.unwrap();

        assert_eq!(first, 4);
        assert_eq!(second, 5);
        assert_eq!(membership.last_generation(), 5);
    }

    #[tokio::test]
    async fn fresh_membership_starts_at_one() {
        let membership = LocalMembership::new(Arc::new(NodeRegistry::new()), 0);
        let (generation, peers) = membership.request_new_generation(Uuid::new_v4()).await.unwrap();
        assert_eq!(generation, 1);
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn peers_mirror_registry() {
        let registry = Arc::new(NodeRegistry::new());
        let node = Node::new("10.0.0.1", 10101, "pfsd", Uuid::new_v4());
        registry.add(node.clone()).await;

        let membership = LocalMembership::new(registry, 0);
        assert_eq!(membership.peers().await, vec![node]);
        assert_eq!(membership.role(), ConsensusRole::Inactive);
    }
}
