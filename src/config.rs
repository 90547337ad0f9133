//! Daemon configuration.
//!
//! Built by the binary from command-line arguments, or directly by tests.
//! [`Config::validate`] runs before anything is bound or loaded.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Name of the metadata directory inside the filesystem directory.
pub const META_DIR: &str = "meta";

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(10);

/// Longest grace period accepted, so shutdown stays bounded.
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// How the server certificate of a dialed peer is checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertVerification {
    Verify,
    /// Accept any certificate. Only reachable through
    /// `--dangerous-skip-tls-verify`.
    DangerouslySkip,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSecurity {
    /// Unauthenticated: ephemeral certificate, no verification.
    Plaintext,
    Tls {
        cert: PathBuf,
        key: PathBuf,
        /// Trust anchors; defaults to the node's own certificate.
        ca: Option<PathBuf>,
        verification: CertVerification,
    },
}

impl TransportSecurity {
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportSecurity::Tls { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// `host:port` of the discovery service.
    pub address: String,
    /// Name the service's certificate must be valid for.
    pub common_name: String,
    pub pool: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the filesystem; metadata lives in `<pfs_dir>/meta`.
    pub pfs_dir: PathBuf,
    pub bind: SocketAddr,
    /// Address advertised to peers. Defaults to the outbound interface.
    pub advertise_ip: Option<IpAddr>,
    /// Name peers verify us under. Defaults to the certificate's CN.
    pub common_name: Option<String>,
    pub discovery: Option<DiscoveryConfig>,
    /// Argon2 PHC hash gating new-generation requests; `None` is an open pool.
    pub pool_password_hash: Option<String>,
    pub security: TransportSecurity,
    /// Run without any peer networking. `None` defers to the attributes
    /// record.
    pub network_off: Option<bool>,
    pub ping_interval: Duration,
    pub renew_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn new(pfs_dir: impl Into<PathBuf>) -> Self {
        Self {
            pfs_dir: pfs_dir.into(),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_ip: None,
            common_name: None,
            discovery: None,
            pool_password_hash: None,
            security: TransportSecurity::Plaintext,
            network_off: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.pfs_dir.join(META_DIR)
    }

    pub fn validate(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.pfs_dir)
            .with_context(|| format!("filesystem directory {} is not accessible", self.pfs_dir.display()))?;
        if !metadata.is_dir() {
            bail!("{} is not a directory", self.pfs_dir.display());
        }

        if self.ping_interval.is_zero() {
            bail!("ping interval must be non-zero");
        }
        if self.renew_interval.is_zero() {
            bail!("renew interval must be non-zero");
        }
        if self.shutdown_grace > MAX_SHUTDOWN_GRACE {
            bail!("shutdown grace period must be at most {:?}", MAX_SHUTDOWN_GRACE);
        }

        if let Some(discovery) = &self.discovery {
            if discovery.address.is_empty() {
                bail!("discovery address must not be empty");
            }
            if discovery.pool.is_empty() {
                bail!("discovery pool name must not be empty");
            }
        }

        if let TransportSecurity::Tls { cert, key, ca, .. } = &self.security {
            for path in [Some(cert), Some(key), ca.as_ref()].into_iter().flatten() {
                if !path.is_file() {
                    bail!("TLS file {} does not exist", path.display());
                }
            }
        }

        if let Some(hash) = &self.pool_password_hash
            && hash.is_empty()
        {
            bail!("pool password hash must not be empty");
        }

        Ok(())
    }
}
