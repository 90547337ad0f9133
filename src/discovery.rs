//! # Discovery Client
//!
//! Joins, renews, and leaves a named pool on the external discovery service.
//!
//! Every call dials the service fresh with a [`DISCOVERY_DIAL_TIMEOUT`]
//! bound, waits at most [`DISCOVERY_CALL_TIMEOUT`] for the reply, and
//! closes the connection. The TLS policy is
//! the one the peer transport uses, passed in as the same client config.
//!
//! Renewal failures are logged and returned but never retried here; a
//! missed renewal is absorbed by the service's lease period.

use std::time::Duration;

use quinn::{ClientConfig, Endpoint};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::identity::Node;
use crate::messages::{DiscoveryRequest, DiscoveryResponse, RpcRequest, RpcResponse};
use crate::rpc;

pub const DISCOVERY_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const DISCOVERY_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// What the discovery service granted on join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Lease period renewals must arrive within; `None` if the service left
    /// it to the client.
    pub renew_interval: Option<Duration>,
    pub peers: Vec<Node>,
}

pub struct DiscoveryClient {
    endpoint: Endpoint,
    client_config: ClientConfig,
    address: String,
    server_name: String,
    self_node: Node,
    pool: Mutex<Option<String>>,
}

impl DiscoveryClient {
    pub fn new(
        endpoint: Endpoint,
        client_config: ClientConfig,
        address: impl Into<String>,
        server_name: impl Into<String>,
        self_node: Node,
    ) -> Self {
        Self {
            endpoint,
            client_config,
            address: address.into(),
            server_name: server_name.into(),
            self_node,
            pool: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Join `pool`, remembering it for later renewals.
    pub async fn join(&self, pool: &str) -> Result<Assignment, Error> {
        let request = DiscoveryRequest::Join {
            pool: pool.to_string(),
            node: self.self_node.clone(),
        };
        match self.exchange(request).await? {
            DiscoveryResponse::Joined {
                renew_interval_ms,
                peers,
            } => {
                *self.pool.lock().await = Some(pool.to_string());
                let peers: Vec<Node> = peers
                    .into_iter()
                    .filter(|p| p.uuid != self.self_node.uuid && p.validate().is_ok())
                    .collect();
                info!(
                    pool,
                    discovery = %self.address,
                    peers = peers.len(),
                    "joined pool"
                );
                Ok(Assignment {
                    renew_interval: (renew_interval_ms > 0)
                        .then(|| Duration::from_millis(renew_interval_ms)),
                    peers,
                })
            }
            DiscoveryResponse::Ack => Err(Error::transport("discovery service did not grant membership")),
        }
    }

    pub async fn renew(&self) -> Result<(), Error> {
        let Some(pool) = self.pool.lock().await.clone() else {
            return Err(Error::invalid_argument("renew before join"));
        };
        let request = DiscoveryRequest::Renew {
            pool: pool.clone(),
            node: self.self_node.clone(),
        };
        match self.exchange(request).await {
            Ok(_) => {
                debug!(pool, "renewed pool membership");
                Ok(())
            }
            Err(e) => {
                warn!(pool, discovery = %self.address, error = %e, "failed to renew pool membership");
                Err(e)
            }
        }
    }

    /// Leave the pool. Failures are logged and otherwise ignored.
    pub async fn disconnect(&self) {
        let request = DiscoveryRequest::Disconnect {
            node: self.self_node.clone(),
        };
        match self.exchange(request).await {
            Ok(_) => info!(discovery = %self.address, "disconnected from discovery service"),
            Err(e) => debug!(discovery = %self.address, error = %e, "discovery disconnect failed"),
        }
        *self.pool.lock().await = None;
    }

    async fn exchange(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse, Error> {
        let conn = rpc::connect(
            &self.endpoint,
            &self.client_config,
            &self.address,
            &self.server_name,
            DISCOVERY_DIAL_TIMEOUT,
        )
        .await?;

        let result = rpc::call(
            &conn,
            &RpcRequest::Discovery(request),
            DISCOVERY_CALL_TIMEOUT,
        )
        .await;
        conn.close(0u32.into(), b"done");

        match result? {
            RpcResponse::Discovery(response) => Ok(response),
            _ => Err(Error::transport("unexpected response type from discovery service")),
        }
    }
}
