//! # pfsd - Peer Filesystem Daemon
//!
//! Control plane of a node in a peer-to-peer encrypted filesystem. Each node
//! holds shares of the filesystem key, keeps track of its peers, and answers
//! their requests for shares and new key generations.
//!
//! - **Membership**: discovery-service pools plus a ping-maintained registry
//! - **Key shares**: generation-indexed store, persisted atomically
//! - **Peer protocol**: QUIC request/response, optionally TLS-authenticated
//! - **Operator interface**: local Unix-socket intercom
//! - **Lifecycle**: ordered teardown and in-place restart
//!
//! ## Architecture
//!
//! Components are plain structs wired together by [`Daemon::start`] and
//! shared through `Arc`. Each owns its state behind its own lock; there is
//! no process-wide state. External collaborators (consensus, port mapping)
//! are traits in [`protocols`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `daemon` | Startup wiring, background loops, teardown steps |
//! | `lifecycle` | State machine, quit token, join barrier, signals |
//! | `config` | Daemon settings and validation |
//! | `error` | Closed error taxonomy shared by every component |
//! | `keys` | Keys, fingerprints, key pieces |
//! | `store` | Generation-indexed key-piece store |
//! | `registry` | UUID-keyed node directory |
//! | `identity` | Node records, UUID persistence, advertised address |
//! | `crypto` | TLS configs, certificates, pool credential |
//! | `transport` | Outbound peer connections and liveness |
//! | `discovery` | Discovery-service join/renew/disconnect |
//! | `handlers` | Inbound peer protocol handlers |
//! | `intercom` | Local operator socket |
//! | `attributes` | Filesystem attributes record |
//! | `consensus` | Stand-in consensus collaborator |
//! | `protocols` | Protocol and collaborator traits |
//! | `rpc` | QUIC request/response plumbing |
//! | `messages` | Wire types and framing |

mod attributes;
mod config;
mod consensus;
mod crypto;
mod daemon;
mod discovery;
mod error;
mod handlers;
mod identity;
mod intercom;
mod keys;
mod lifecycle;
mod messages;
mod registry;
mod rpc;
mod store;
mod transport;

pub mod protocols;

pub use attributes::FileSystemAttributes;
pub use config::{CertVerification, Config, DiscoveryConfig, TransportSecurity};
pub use consensus::LocalMembership;
pub use crypto::{PoolCredential, ServerVerification, TlsIdentity};
pub use daemon::{Collaborators, Daemon};
pub use discovery::{Assignment, DiscoveryClient};
pub use error::{Error, ErrorKind};
pub use handlers::PeerService;
pub use identity::Node;
pub use intercom::{IntercomClient, STATUS_NETWORKING_DISABLED};
pub use keys::{Key, KeyPiece, KeySizeError};
pub use lifecycle::{reexec, wait_for_signal, Lifecycle, ShutdownKind, State, Teardown};
pub use messages::{
    DiscoveryRequest, DiscoveryResponse, PeerRequest, PeerResponse, RpcRequest, RpcResponse,
    StatusReport,
};
pub use registry::NodeRegistry;
pub use store::KeyPieceStore;
pub use transport::{PeerTransport, DIAL_TIMEOUT, MAX_CONSECUTIVE_PING_FAILURES, RPC_TIMEOUT};

/// Client and server QUIC helpers, for tooling and tests that speak the
/// peer or discovery protocol directly.
pub mod net {
    pub use crate::crypto::{create_client_config, create_server_config, ALPN};
    pub use crate::rpc::{call, connect, serve};
}
