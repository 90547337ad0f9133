//! # Peer Transport
//!
//! Outbound side of the peer network: one cached QUIC connection per peer
//! address, the liveness protocol, and the client half of every peer RPC.
//!
//! ## Connection Management
//!
//! - `add_peer` / `add_node` are idempotent: an address with a live cached
//!   connection is not dialed again.
//! - Dials are bounded by [`DIAL_TIMEOUT`], each request/response exchange
//!   by [`RPC_TIMEOUT`]. The lock over the peer table is never held across a
//!   dial or an RPC.
//! - A transport-level failure drops the cached connection; the next call
//!   redials. Typed errors from the remote handler (e.g. `NotFound`) leave
//!   the connection in place.
//! - An entry left with neither a connection nor a failure count is
//!   removed, so addresses that were dialed once and never pinged do not
//!   accumulate.
//!
//! ## Liveness
//!
//! Each peer entry counts consecutive failed pings. A success resets the
//! count. The daemon's ping loop reads the count to decide eviction once it
//! reaches [`MAX_CONSECUTIVE_PING_FAILURES`].
//!
//! ## Security
//!
//! In TLS mode the server name presented for verification is the peer's
//! advertised CommonName, so the peer must hold a certificate valid for it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::crypto::DEFAULT_SERVER_NAME;
use crate::error::{Error, ErrorKind};
use crate::identity::Node;
use crate::keys::KeyPiece;
use crate::messages::{PeerRequest, PeerResponse, RpcRequest, RpcResponse};
use crate::protocols::PeerRpc;
use crate::rpc;

/// Bound on establishing a connection to a peer.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on one request/response exchange with a connected peer.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed pings after which a peer is evicted.
pub const MAX_CONSECUTIVE_PING_FAILURES: u32 = 5;

struct PeerEntry {
    connection: Option<Connection>,
    consecutive_failures: u32,
}

impl PeerEntry {
    fn live_connection(&self) -> Option<Connection> {
        self.connection
            .as_ref()
            .filter(|c| c.close_reason().is_none())
            .cloned()
    }

    fn is_idle(&self) -> bool {
        self.connection.is_none() && self.consecutive_failures == 0
    }
}

pub struct PeerTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    self_node: Node,
    dial_timeout: Duration,
    rpc_timeout: Duration,
    peers: Mutex<HashMap<String, PeerEntry>>,
}

impl PeerTransport {
    pub fn new(endpoint: Endpoint, client_config: ClientConfig, self_node: Node) -> Self {
        Self {
            endpoint,
            client_config,
            self_node,
            dial_timeout: DIAL_TIMEOUT,
            rpc_timeout: RPC_TIMEOUT,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// Connect to `address` unless a live connection to it already exists.
    pub async fn add_peer(&self, address: &str) -> Result<(), Error> {
        self.connection_to(address, DEFAULT_SERVER_NAME).await.map(|_| ())
    }

    /// Connect to `node`, verifying it under its advertised CommonName.
    pub async fn add_node(&self, node: &Node) -> Result<(), Error> {
        self.connection_for(node).await.map(|_| ())
    }

    /// Addresses with a live connection, as of the call.
    pub async fn peers(&self) -> Vec<String> {
        self.peers
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.live_connection().is_some())
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub async fn consecutive_failures(&self, node: &Node) -> u32 {
        self.peers
            .lock()
            .await
            .get(&node.address())
            .map_or(0, |e| e.consecutive_failures)
    }

    /// Forget `node`'s address and close any connection to it.
    pub async fn drop_peer(&self, node: &Node) {
        let removed = self.peers.lock().await.remove(&node.address());
        if let Some(entry) = removed
            && let Some(conn) = entry.connection
        {
            conn.close(0u32.into(), b"evicted");
        }
        debug!(peer = %node, "dropped peer");
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let mut peers = self.peers.lock().await;
        for entry in peers.values_mut() {
            if let Some(conn) = entry.connection.take() {
                conn.close(0u32.into(), b"shutdown");
            }
        }
    }

    async fn connection_for(&self, node: &Node) -> Result<Connection, Error> {
        let server_name = if node.common_name.is_empty() {
            DEFAULT_SERVER_NAME
        } else {
            node.common_name.as_str()
        };
        self.connection_to(&node.address(), server_name).await
    }

    async fn connection_to(&self, address: &str, server_name: &str) -> Result<Connection, Error> {
        if let Some(conn) = self
            .peers
            .lock()
            .await
            .get(address)
            .and_then(PeerEntry::live_connection)
        {
            return Ok(conn);
        }

        let dialed = rpc::connect(
            &self.endpoint,
            &self.client_config,
            address,
            server_name,
            self.dial_timeout,
        )
        .await;

        let mut peers = self.peers.lock().await;
        match dialed {
            Ok(conn) => {
                debug!(peer = %address, server_name, "connected to peer");
                peers
                    .entry(address.to_string())
                    .or_insert(PeerEntry {
                        connection: None,
                        consecutive_failures: 0,
                    })
                    .connection = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                debug!(peer = %address, error = %e, "dial failed");
                if let Some(entry) = peers.get_mut(address) {
                    entry.connection = None;
                    if entry.is_idle() {
                        peers.remove(address);
                    }
                }
                Err(e)
            }
        }
    }

    async fn invalidate(&self, address: &str) {
        let mut peers = self.peers.lock().await;
        let Some(entry) = peers.get_mut(address) else {
            return;
        };
        if entry.connection.take().is_some() {
            debug!(peer = %address, "invalidated cached connection after failure");
        }
        if entry.is_idle() {
            peers.remove(address);
        }
    }

    async fn record_ping(&self, address: &str, ok: bool) -> u32 {
        let mut peers = self.peers.lock().await;
        let entry = peers.entry(address.to_string()).or_insert(PeerEntry {
            connection: None,
            consecutive_failures: 0,
        });
        if ok {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
        entry.consecutive_failures
    }

    async fn peer_call(&self, to: &Node, request: PeerRequest) -> Result<PeerResponse, Error> {
        let address = to.address();
        let conn = self.connection_for(to).await?;

        match rpc::call(&conn, &RpcRequest::Peer(request), self.rpc_timeout).await {
            Ok(RpcResponse::Peer(response)) => Ok(response),
            Ok(other) => {
                warn!(peer = %address, response = ?other, "unexpected response to peer request");
                Err(Error::transport("unexpected response type for peer request"))
            }
            Err(e) => {
                if e.kind() == ErrorKind::Transport {
                    self.invalidate(&address).await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PeerRpc for PeerTransport {
    async fn ping(&self, to: &Node) -> Result<(), Error> {
        let result = match self
            .peer_call(to, PeerRequest::Ping { from: self.self_node.clone() })
            .await
        {
            Ok(PeerResponse::Ack) => Ok(()),
            Ok(_) => Err(Error::transport("unexpected response to ping")),
            Err(e) => Err(e),
        };

        let failures = self.record_ping(&to.address(), result.is_ok()).await;
        match &result {
            Ok(()) => trace!(peer = %to, "ping ok"),
            Err(e) => warn!(peer = %to, uuid = %to.uuid, failures, error = %e, "ping failed"),
        }
        result
    }

    async fn request_key_piece(&self, to: &Node, generation: i64) -> Result<KeyPiece, Error> {
        let request = PeerRequest::RequestKeyPiece {
            node: self.self_node.clone(),
            generation,
        };
        match self.peer_call(to, request).await? {
            PeerResponse::KeyPiece(piece) => Ok(piece),
            _ => Err(Error::transport("unexpected response to key piece request")),
        }
    }

    async fn new_generation(&self, to: &Node, pool_password: &str) -> Result<(i64, Vec<Node>), Error> {
        let request = PeerRequest::NewGeneration {
            node: self.self_node.clone(),
            pool_password: pool_password.to_string(),
        };
        match self.peer_call(to, request).await? {
            PeerResponse::Generation { generation, peers } => Ok((generation, peers)),
            _ => Err(Error::transport("unexpected response to new generation request")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::crypto::{create_client_config, create_server_config, ServerVerification, TlsIdentity};
    use crate::protocols::RequestHandler;

    struct CountingHandler {
        pings: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for CountingHandler {
        async fn handle(&self, request: RpcRequest, _remote: SocketAddr) -> RpcResponse {
            match request {
                RpcRequest::Peer(PeerRequest::Ping { .. }) => {
                    self.pings.fetch_add(1, Ordering::SeqCst);
                    RpcResponse::Peer(PeerResponse::Ack)
                }
                _ => RpcResponse::Error(Error::not_found("nothing here")),
            }
        }
    }

    fn endpoint() -> Endpoint {
        let server = create_server_config(TlsIdentity::ephemeral("pfsd").unwrap()).unwrap();
        Endpoint::server(server, "127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn transport() -> PeerTransport {
        let config = create_client_config(&ServerVerification::Skip).unwrap();
        let me = Node::new("127.0.0.1", 9, "pfsd", Uuid::new_v4());
        PeerTransport::new(endpoint(), config, me).with_dial_timeout(Duration::from_millis(300))
    }

    async fn spawn_server(handler: Arc<CountingHandler>) -> (Node, CancellationToken) {
        let server = endpoint();
        let port = server.local_addr().unwrap().port();
        let quit = CancellationToken::new();
        tokio::spawn(rpc::serve(server, handler, quit.clone()));
        (Node::new("127.0.0.1", port, "pfsd", Uuid::new_v4()), quit)
    }

    #[tokio::test]
    async fn add_peer_is_idempotent() {
        let handler = Arc::new(CountingHandler { pings: AtomicUsize::new(0) });
        let (node, quit) = spawn_server(handler).await;
        let transport = transport();

        transport.add_peer(&node.address()).await.unwrap();
        transport.add_peer(&node.address()).await.unwrap();

        assert_eq!(transport.peers().await, vec![node.address()]);
        quit.cancel();
    }

    #[tokio::test]
    async fn ping_reaches_handler_and_resets_failures() {
        let handler = Arc::new(CountingHandler { pings: AtomicUsize::new(0) });
        let (node, quit) = spawn_server(handler.clone()).await;
        let transport = transport();

        transport.ping(&node).await.unwrap();
        transport.ping(&node).await.unwrap();

        assert_eq!(handler.pings.load(Ordering::SeqCst), 2);
        assert_eq!(transport.consecutive_failures(&node).await, 0);
        quit.cancel();
    }

    #[tokio::test]
    async fn ping_failures_accumulate() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let node = Node::new("127.0.0.1", port, "pfsd", Uuid::new_v4());
        let transport = transport();

        for expected in 1..=3 {
            let err = transport.ping(&node).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transport);
            assert_eq!(transport.consecutive_failures(&node).await, expected);
        }
        assert!(transport.peers().await.is_empty());
    }

    #[tokio::test]
    async fn remote_typed_error_passes_through() {
        let handler = Arc::new(CountingHandler { pings: AtomicUsize::new(0) });
        let (node, quit) = spawn_server(handler).await;
        let transport = transport();

        let err = transport.request_key_piece(&node, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(transport.peers().await.len(), 1);
        quit.cancel();
    }

    #[tokio::test]
    async fn failed_dials_leave_no_entries_behind() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let node = Node::new("127.0.0.1", port, "pfsd", Uuid::new_v4());
        let transport = transport();

        assert!(transport.add_peer(&node.address()).await.is_err());
        assert!(transport.request_key_piece(&node, 1).await.is_err());
        assert!(transport.peers.lock().await.is_empty());

        // A pinged peer keeps its failure count across other failed calls.
        assert!(transport.ping(&node).await.is_err());
        assert!(transport.request_key_piece(&node, 1).await.is_err());
        assert_eq!(transport.consecutive_failures(&node).await, 1);
        assert_eq!(transport.peers.lock().await.len(), 1);
    }

    struct Stall;

    #[async_trait]
    impl RequestHandler for Stall {
        async fn handle(&self, _request: RpcRequest, _remote: SocketAddr) -> RpcResponse {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            RpcResponse::Peer(PeerResponse::Ack)
        }
    }

    #[tokio::test]
    async fn stalled_peer_ping_is_bounded() {
        let server = endpoint();
        let port = server.local_addr().unwrap().port();
        let quit = CancellationToken::new();
        tokio::spawn(rpc::serve(server, Arc::new(Stall), quit.clone()));
        let node = Node::new("127.0.0.1", port, "pfsd", Uuid::new_v4());
        let transport = transport().with_rpc_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = transport.ping(&node).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.consecutive_failures(&node).await, 1);
        quit.cancel();
    }

    #[tokio::test]
    async fn drop_peer_forgets_connection() {
        let handler = Arc::new(CountingHandler { pings: AtomicUsize::new(0) });
        let (node, quit) = spawn_server(handler).await;
        let transport = transport();

        transport.add_node(&node).await.unwrap();
        transport.drop_peer(&node).await;

        assert!(transport.peers().await.is_empty());
        quit.cancel();
    }
}
