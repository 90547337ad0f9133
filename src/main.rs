use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pfsd::{
    reexec, wait_for_signal, CertVerification, Collaborators, Config, Daemon, DiscoveryConfig,
    ShutdownKind, TransportSecurity,
};

#[derive(Parser, Debug)]
#[command(name = "pfsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Filesystem directory (metadata lives in <DIR>/meta)
    #[arg(value_name = "DIR")]
    pfs_dir: PathBuf,

    #[arg(short, long, default_value = "0.0.0.0:10101")]
    bind: SocketAddr,

    /// Address advertised to peers (default: outbound interface)
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// Name peers verify this node under (default: certificate CN)
    #[arg(long)]
    common_name: Option<String>,

    /// Discovery service address (host:port)
    #[arg(short, long)]
    discovery: Option<String>,

    #[arg(long, default_value = "pfsd")]
    discovery_common_name: String,

    #[arg(short, long, default_value = "default")]
    pool: String,

    /// Argon2 PHC hash of the pool password
    #[arg(long)]
    pool_password_hash: Option<String>,

    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Trust anchors for peer certificates (default: own certificate)
    #[arg(long, requires = "cert")]
    ca: Option<PathBuf>,

    /// Accept any peer certificate. Development only.
    #[arg(long, requires = "cert")]
    dangerous_skip_tls_verify: bool,

    /// Run without peer networking
    #[arg(long)]
    network_off: bool,

    #[arg(long, default_value = "60")]
    ping_interval_secs: u64,

    #[arg(long, default_value = "60")]
    renew_interval_secs: u64,

    #[arg(long, default_value = "10")]
    shutdown_grace_ms: u64,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let security = match (self.cert, self.key) {
            (Some(cert), Some(key)) => TransportSecurity::Tls {
                cert,
                key,
                ca: self.ca,
                verification: if self.dangerous_skip_tls_verify {
                    CertVerification::DangerouslySkip
                } else {
                    CertVerification::Verify
                },
            },
            (None, None) => TransportSecurity::Plaintext,
            _ => bail!("--cert and --key must be given together"),
        };

        let mut config = Config::new(self.pfs_dir);
        config.bind = self.bind;
        config.advertise_ip = self.advertise_ip;
        config.common_name = self.common_name;
        config.discovery = self.discovery.map(|address| DiscoveryConfig {
            address,
            common_name: self.discovery_common_name,
            pool: self.pool,
        });
        config.pool_password_hash = self.pool_password_hash;
        config.security = security;
        config.network_off = self.network_off.then_some(true);
        config.ping_interval = Duration::from_secs(self.ping_interval_secs);
        config.renew_interval = Duration::from_secs(self.renew_interval_secs);
        config.shutdown_grace = Duration::from_millis(self.shutdown_grace_ms);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.into_config()?;
    if !config.security.is_tls() {
        warn!("running without TLS; peers are not authenticated");
    }

    let daemon = Daemon::start(config, Collaborators::default()).await?;
    info!(
        uuid = %daemon.uuid(),
        addr = %daemon.self_node(),
        intercom = %daemon.intercom_path().display(),
        "pfsd started"
    );

    let kind = wait_for_signal().await?;
    daemon.shutdown().await;
    drop(daemon);

    match kind {
        ShutdownKind::Terminate => {
            info!("pfsd stopped");
            Ok(())
        }
        ShutdownKind::Restart => Err(reexec()),
    }
}
