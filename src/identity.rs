//! # Node Identity
//!
//! A [`Node`] is the identity record peers exchange: where a node listens,
//! the TLS name it answers to, and its UUID.
//!
//! ## Identity Model
//!
//! - **UUID is the identity key.** IP, port, and CommonName may change over a
//!   node's lifetime (re-pinged from a new address) without changing who the
//!   node is.
//! - A node's UUID is persisted in `meta/uuid` so a restarted daemon rejoins
//!   the cluster as the same member.
//! - The advertised IP defaults to the address of the outbound interface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Error;
use crate::store::write_atomic;

/// File holding this node's UUID inside the metadata directory.
pub const UUID_FILENAME: &str = "uuid";

/// Maximum accepted length of a peer-supplied host or CommonName.
const MAX_FIELD_LEN: usize = 253;

/// Identity record of a cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub ip: String,
    pub port: u16,
    pub common_name: String,
    pub uuid: Uuid,
}

impl Node {
    pub fn new(ip: impl Into<String>, port: u16, common_name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            ip: ip.into(),
            port,
            common_name: common_name.into(),
            uuid,
        }
    }

    /// `host:port` form used for dialing. IPv6 literals are bracketed.
    pub fn address(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => SocketAddr::new(IpAddr::V6(v6), self.port).to_string(),
            _ => format!("{}:{}", self.ip, self.port),
        }
    }

    /// Reject records a peer could not plausibly have sent about itself.
    pub fn validate(&self) -> Result<(), Error> {
        if self.ip.is_empty() || self.ip.len() > MAX_FIELD_LEN {
            return Err(Error::invalid_argument("node ip is empty or too long"));
        }
        if self.ip.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::invalid_argument("node ip contains invalid characters"));
        }
        if self.port == 0 {
            return Err(Error::invalid_argument("node port must be non-zero"));
        }
        if self.common_name.len() > MAX_FIELD_LEN {
            return Err(Error::invalid_argument("node common name too long"));
        }
        if self.uuid.is_nil() {
            return Err(Error::invalid_argument("node uuid must not be nil"));
        }
        Ok(())
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Read this node's UUID from `meta_dir`, creating it on first start.
pub async fn load_or_create_uuid(meta_dir: &Path) -> Result<Uuid> {
    let path = meta_dir.join(UUID_FILENAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let uuid = Uuid::parse_str(contents.trim())
                .with_context(|| format!("corrupt node uuid in {}", path.display()))?;
            debug!(uuid = %uuid, "loaded node uuid");
            Ok(uuid)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let uuid = Uuid::new_v4();
            write_atomic(&path, uuid.to_string().as_bytes())
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(uuid = %uuid, "generated new node uuid");
            Ok(uuid)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Best guess at the address peers should use to reach us.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which local
/// interface would route to the target. Falls back to loopback.
pub fn outbound_ip() -> IpAddr {
    let probe_targets = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];

    for target in probe_targets {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0")
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
        {
            let ip = local.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                return ip;
            }
        }
    }

    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::new("10.0.0.5", 10101, "pfsd", Uuid::new_v4())
    }

    #[test]
    fn test_address_formats() {
        let v4 = sample();
        assert_eq!(v4.address(), "10.0.0.5:10101");

        let v6 = Node::new("::1", 9000, "pfsd", Uuid::new_v4());
        assert_eq!(v6.address(), "[::1]:9000");

        let host = Node::new("node-a.local", 9000, "pfsd", Uuid::new_v4());
        assert_eq!(host.address(), "node-a.local:9000");
    }

    #[test]
    fn test_validate_accepts_sane_record() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_records() {
        let mut empty_ip = sample();
        empty_ip.ip.clear();
        assert!(empty_ip.validate().is_err());

        let mut zero_port = sample();
        zero_port.port = 0;
        assert!(zero_port.validate().is_err());

        let mut nil = sample();
        nil.uuid = Uuid::nil();
        assert!(nil.validate().is_err());

        let mut long_cn = sample();
        long_cn.common_name = "x".repeat(300);
        assert!(long_cn.validate().is_err());

        let mut spaced = sample();
        spaced.ip = "10.0.0.1 evil".into();
        assert!(spaced.validate().is_err());
    }

    #[tokio::test]
    async fn test_uuid_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_uuid(dir.path()).await.unwrap();
        let second = load_or_create_uuid(dir.path()).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_nil());
    }

    #[tokio::test]
    async fn test_corrupt_uuid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(UUID_FILENAME), "not-a-uuid").unwrap();
        assert!(load_or_create_uuid(dir.path()).await.is_err());
    }

    #[test]
    fn test_outbound_ip_is_usable() {
        let ip = outbound_ip();
        assert!(!ip.is_unspecified());
    }
}
