//! Directory of known cluster members, keyed by UUID.
//!
//! Entries are created by discovery or a first inbound ping and overwritten
//! by every later ping from the same UUID. No method awaits anything other
//! than the lock itself, so the lock is never held across network I/O.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::error::Error;
use crate::identity::Node;

#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<Uuid, Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `node.uuid`.
    pub async fn add(&self, node: Node) {
        trace!(uuid = %node.uuid, addr = %node, "registry upsert");
        self.nodes.lock().await.insert(node.uuid, node);
    }

    /// Remove the record for `node.uuid`, if any.
    pub async fn remove(&self, node: &Node) {
        self.remove_uuid(&node.uuid).await;
    }

    pub async fn remove_uuid(&self, uuid: &Uuid) -> Option<Node> {
        self.nodes.lock().await.remove(uuid)
    }

    pub async fn get_node(&self, uuid: &Uuid) -> Result<Node, Error> {
        self.nodes
            .lock()
            .await
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no node with uuid {}", uuid)))
    }

    /// Point-in-time copy of every known node, in no particular order.
    pub async fn get_all(&self) -> Vec<Node> {
        self.nodes.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn node(ip: &str, uuid: Uuid) -> Node {
        Node::new(ip, 10101, "pfsd", uuid)
    }

    #[tokio::test]
    async fn add_is_idempotent_and_latest_wins() {
        let registry = NodeRegistry::new();
        let id = Uuid::new_v4();

        registry.add(node("10.0.0.1", id)).await;
        registry.add(node("10.0.0.2", id)).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get_node(&id).await.unwrap().ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn unknown_uuid_is_not_found() {
        let registry = NodeRegistry::new();
        let err = registry.get_node(&Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = NodeRegistry::new();
        let n = node("10.0.0.1", Uuid::new_v4());

        registry.add(n.clone()).await;
        registry.remove(&n).await;
        registry.remove(&n).await;

        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn get_all_counts_distinct_minus_removed() {
        let registry = NodeRegistry::new();
        let nodes: Vec<Node> = (0..5)
            .map(|i| node(&format!("10.0.0.{}", i + 1), Uuid::new_v4()))
            .collect();

        for n in &nodes {
            registry.add(n.clone()).await;
        }
        registry.add(nodes[0].clone()).await;
        registry.remove(&nodes[1]).await;
        registry.remove(&nodes[2]).await;

        let all = registry.get_all().await;
        assert_eq!(all.len(), 3);
        assert!(all.contains(&nodes[0]));
        assert!(!all.contains(&nodes[1]));
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_adds() {
        let registry = NodeRegistry::new();
        registry.add(node("10.0.0.1", Uuid::new_v4())).await;

        let snapshot = registry.get_all().await;
        registry.add(node("10.0.0.2", Uuid::new_v4())).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len().await, 2);
    }
}
