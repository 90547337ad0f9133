//! # Daemon
//!
//! Assembles every component into a running node and owns their
//! single lifecycle.
//!
//! ## Startup
//!
//! 1. Validate configuration, create `meta/`
//! 2. Load node UUID, filesystem attributes, key-piece store
//! 3. (network on) Build TLS, bind the QUIC endpoint, build the self `Node`
//! 4. Bind the intercom socket and start its accept loop
//! 5. (network on) Start the protocol listener, join the discovery pool,
//!    start the ping and renew loops
//! 6. Mark the lifecycle running
//!
//! Every component is created here and handed to the others explicitly;
//! there is no process-wide state.
//!
//! ## Ping loop
//!
//! Each round pings every registry node concurrently. A node whose
//! consecutive failures reach `MAX_CONSECUTIVE_PING_FAILURES` is removed
//! from the registry and its connection dropped. A later inbound ping or
//! discovery join adds it back.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::Endpoint;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attributes::FileSystemAttributes;
use crate::config::{CertVerification, Config, TransportSecurity};
use crate::consensus::LocalMembership;
use crate::crypto::{self, PoolCredential, ServerVerification, TlsIdentity, DEFAULT_SERVER_NAME};
use crate::discovery::DiscoveryClient;
use crate::error::{Error, ErrorKind};
use crate::handlers::PeerService;
use crate::identity::{self, Node};
use crate::intercom::{IntercomServer, IntercomState, INTERCOM_SOCKET};
use crate::keys::KeyPiece;
use crate::lifecycle::{Lifecycle, State, Teardown};
use crate::protocols::{Consensus, PeerRpc, PortMapper};
use crate::registry::NodeRegistry;
use crate::rpc;
use crate::store::KeyPieceStore;
use crate::transport::{PeerTransport, MAX_CONSECUTIVE_PING_FAILURES};

/// External collaborators the daemon calls but does not implement.
#[derive(Default)]
pub struct Collaborators {
    /// Replicated consensus layer. `LocalMembership` is used when absent.
    pub consensus: Option<Arc<dyn Consensus>>,
    pub port_mapper: Option<Arc<dyn PortMapper>>,
}

struct Network {
    endpoint: Endpoint,
    transport: Arc<PeerTransport>,
    discovery: Option<Arc<DiscoveryClient>>,
}

pub struct Daemon {
    meta_dir: PathBuf,
    self_node: Node,
    network_off: bool,
    tls_active: bool,
    attributes: FileSystemAttributes,
    registry: Arc<NodeRegistry>,
    key_pieces: Arc<KeyPieceStore>,
    consensus: Option<Arc<dyn Consensus>>,
    port_mapper: Option<Arc<dyn PortMapper>>,
    network: Option<Network>,
    intercom: IntercomServer,
    lifecycle: Lifecycle,
}

impl Daemon {
    pub async fn start(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let meta_dir = config.meta_dir();
        tokio::fs::create_dir_all(&meta_dir)
            .await
            .with_context(|| format!("failed to create {}", meta_dir.display()))?;

        let uuid = identity::load_or_create_uuid(&meta_dir).await?;
        let attributes = FileSystemAttributes::load(&meta_dir).await?.unwrap_or_default();
        let network_off = config.network_off.unwrap_or(attributes.network_off);
        let key_pieces = Arc::new(KeyPieceStore::open(&meta_dir).await?);
        let registry = Arc::new(NodeRegistry::new());
        let lifecycle = Lifecycle::new(config.shutdown_grace);

        let pool = match &config.pool_password_hash {
            Some(phc) => PoolCredential::from_phc(phc)?,
            None => PoolCredential::open(),
        };

        let ip = advertised_ip(&config);
        let (self_node, tls_active, network, consensus) = if network_off {
            info!(uuid = %uuid, "networking disabled");
            let node = Node::new(ip.to_string(), config.bind.port(), DEFAULT_SERVER_NAME, uuid);
            (node, false, None, None)
        } else {
            let tls = TlsSetup::from_config(&config)?;
            let endpoint = Endpoint::server(crypto::create_server_config(tls.identity)?, config.bind)
                .with_context(|| format!("failed to bind QUIC endpoint on {}", config.bind))?;
            let port = endpoint.local_addr().context("failed to read bound address")?.port();
            let node = Node::new(ip.to_string(), port, tls.common_name.clone(), uuid);
            node.validate()?;

            let client_config = crypto::create_client_config(&tls.verification)?;
            let transport = Arc::new(PeerTransport::new(
                endpoint.clone(),
                client_config.clone(),
                node.clone(),
            ));
            let discovery = config.discovery.as_ref().map(|d| {
                Arc::new(DiscoveryClient::new(
                    endpoint.clone(),
                    client_config.clone(),
                    d.address.clone(),
                    d.common_name.clone(),
                    node.clone(),
                ))
            });

            let consensus = match collaborators.consensus {
                Some(c) => c,
                None => {
                    let last = key_pieces.generations().await.last().copied().unwrap_or(0);
                    Arc::new(LocalMembership::new(registry.clone(), last)) as Arc<dyn Consensus>
                }
            };

            info!(
                uuid = %uuid,
                addr = %node,
                common_name = %node.common_name,
                tls = tls.active,
                "peer endpoint bound"
            );
            let network = Network {
                endpoint,
                transport,
                discovery,
            };
            (node, tls.active, Some(network), Some(consensus))
        };

        let intercom_state = Arc::new(IntercomState {
            started: Instant::now(),
            network_off,
            tls_active,
            port: self_node.port,
            consensus: consensus.clone(),
        });
        let (intercom, intercom_listener) =
            IntercomServer::bind(&meta_dir.join(INTERCOM_SOCKET), intercom_state)?;
        lifecycle.spawn("intercom", intercom_listener.run());

        let daemon = Self {
            meta_dir,
            self_node,
            network_off,
            tls_active,
            attributes,
            registry,
            key_pieces,
            consensus,
            port_mapper: collaborators.port_mapper,
            network,
            intercom,
            lifecycle,
        };

        if let Some(network) = &daemon.network {
            daemon.start_network(network, &config, pool).await;
        }

        daemon.lifecycle.mark_running();
        Ok(daemon)
    }

    async fn start_network(&self, network: &Network, config: &Config, pool: PoolCredential) {
        let quit = self.lifecycle.quit_signal();

        let service = Arc::new(PeerService::new(
            self.registry.clone(),
            self.key_pieces.clone(),
            pool,
            self.consensus.clone(),
        ));
        self.lifecycle
            .spawn("protocol", rpc::serve(network.endpoint.clone(), service, quit.clone()));

        let mut renew_interval = config.renew_interval;
        if let (Some(discovery), Some(settings)) = (&network.discovery, &config.discovery) {
            match discovery.join(&settings.pool).await {
                Ok(assignment) => {
                    for peer in assignment.peers {
                        self.registry.add(peer).await;
                    }
                    if let Some(interval) = assignment.renew_interval {
                        renew_interval = interval;
                    }
                }
                Err(e) => warn!(pool = %settings.pool, error = %e, "failed to join pool, will retry"),
            }
            self.lifecycle.spawn(
                "renew",
                renew_loop(
                    discovery.clone(),
                    self.registry.clone(),
                    settings.pool.clone(),
                    renew_interval,
                    quit.clone(),
                ),
            );
        }

        self.lifecycle.spawn(
            "ping",
            ping_loop(
                self.registry.clone(),
                network.transport.clone(),
                self.self_node.uuid,
                config.ping_interval,
                quit,
            ),
        );
    }

    pub fn uuid(&self) -> Uuid {
        self.self_node.uuid
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.network.as_ref().and_then(|n| n.endpoint.local_addr().ok())
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn intercom_path(&self) -> &Path {
        self.intercom.path()
    }

    pub fn network_off(&self) -> bool {
        self.network_off
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn attributes(&self) -> &FileSystemAttributes {
        &self.attributes
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn key_pieces(&self) -> &Arc<KeyPieceStore> {
        &self.key_pieces
    }

    /// Client half of the peer protocol, when networking is on.
    pub fn peers(&self) -> Option<&Arc<PeerTransport>> {
        self.network.as_ref().map(|n| &n.transport)
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Fetch the piece the node `uuid` holds for us at `generation`.
    pub async fn request_key_piece(&self, uuid: &Uuid, generation: i64) -> Result<KeyPiece, Error> {
        let Some(network) = &self.network else {
            return Err(Error::transport("networking disabled"));
        };
        let node = self.registry.get_node(uuid).await?;
        network.transport.request_key_piece(&node, generation).await
    }

    /// Run the ordered teardown. Returns `false` if it already ran.
    pub async fn shutdown(&self) -> bool {
        self.lifecycle.shutdown(self).await
    }
}

#[async_trait]
impl Teardown for Daemon {
    async fn release_port_mapping(&self) -> Result<()> {
        if let Some(mapper) = &self.port_mapper
            && !self.network_off
        {
            mapper.clear_port_mapping(self.self_node.port).await?;
            debug!(port = self.self_node.port, "port mapping released");
        }
        Ok(())
    }

    async fn disconnect_discovery(&self) -> Result<()> {
        if let Some(discovery) = self.network.as_ref().and_then(|n| n.discovery.as_ref()) {
            discovery.disconnect().await;
        }
        Ok(())
    }

    async fn stop_intercom(&self) -> Result<()> {
        self.intercom.stop_accept();
        Ok(())
    }

    async fn stop_protocol_server(&self) -> Result<()> {
        if let Some(network) = &self.network {
            network.transport.close_all().await;
            network.endpoint.close(0u32.into(), b"shutdown");
            info!("protocol server stopped");
        }
        Ok(())
    }
}

struct TlsSetup {
    identity: TlsIdentity,
    verification: ServerVerification,
    common_name: String,
    active: bool,
}

impl TlsSetup {
    fn from_config(config: &Config) -> Result<Self> {
        match &config.security {
            TransportSecurity::Plaintext => {
                let common_name = config
                    .common_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
                Ok(Self {
                    identity: TlsIdentity::ephemeral(&common_name)?,
                    verification: ServerVerification::Skip,
                    common_name,
                    active: false,
                })
            }
            TransportSecurity::Tls {
                cert,
                key,
                ca,
                verification,
            } => {
                let identity = TlsIdentity::load_pem(cert, key)?;
                let common_name = config
                    .common_name
                    .clone()
                    .or_else(|| identity.common_name())
                    .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
                let verification = match verification {
                    CertVerification::Verify => {
                        let roots = match ca {
                            Some(ca) => crypto::load_roots(ca)?,
                            None => crypto::roots_from(identity.certs.clone())?,
                        };
                        ServerVerification::Roots(Arc::new(roots))
                    }
                    CertVerification::DangerouslySkip => {
                        warn!("TLS certificate verification is DISABLED; peers are not authenticated");
                        ServerVerification::Skip
                    }
                };
                Ok(Self {
                    identity,
                    verification,
                    common_name,
                    active: true,
                })
            }
        }
    }
}

fn advertised_ip(config: &Config) -> IpAddr {
    if let Some(ip) = config.advertise_ip {
        return ip;
    }
    let bound = config.bind.ip();
    if !bound.is_unspecified() {
        return bound;
    }
    identity::outbound_ip()
}

async fn ping_loop(
    registry: Arc<NodeRegistry>,
    transport: Arc<PeerTransport>,
    self_uuid: Uuid,
    interval: Duration,
    quit: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = quit.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let round = ping_round(&registry, &transport, self_uuid);
        tokio::select! {
            _ = quit.cancelled() => break,
            _ = round => {}
        }
    }
}

async fn ping_round(registry: &Arc<NodeRegistry>, transport: &Arc<PeerTransport>, self_uuid: Uuid) {
    let mut pings = JoinSet::new();
    for node in registry.get_all().await {
        if node.uuid == self_uuid {
            continue;
        }
        let transport = transport.clone();
        pings.spawn(async move {
            let ok = transport.ping(&node).await.is_ok();
            let failures = transport.consecutive_failures(&node).await;
            (node, ok, failures)
        });
    }

    while let Some(joined) = pings.join_next().await {
        let Ok((node, ok, failures)) = joined else {
            continue;
        };
        if !ok && failures >= MAX_CONSECUTIVE_PING_FAILURES {
            // A node re-pinged from a new address during the round stays.
            if registry.get_node(&node.uuid).await.ok().as_ref() == Some(&node) {
                registry.remove(&node).await;
            }
            transport.drop_peer(&node).await;
            warn!(peer = %node, uuid = %node.uuid, failures, "evicted unreachable peer");
        }
    }
}

async fn renew_loop(
    discovery: Arc<DiscoveryClient>,
    registry: Arc<NodeRegistry>,
    pool: String,
    interval: Duration,
    quit: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = quit.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Renewing before any successful join fails with InvalidArgument.
        let attempt = async {
            if let Err(e) = discovery.renew().await
                && e.kind() == ErrorKind::InvalidArgument
            {
                match discovery.join(&pool).await {
                    Ok(assignment) => {
                        for peer in assignment.peers {
                            registry.add(peer).await;
                        }
                    }
                    Err(e) => debug!(pool = %pool, error = %e, "pool join retry failed"),
                }
            }
        };
        tokio::select! {
            _ = quit.cancelled() => break,
            _ = attempt => {}
        }
    }
}
