//! # Cryptographic Infrastructure
//!
//! - **TLS**: QUIC server/client configurations for the peer and discovery
//!   protocols
//! - **Certificates**: PEM loading, ephemeral self-signed generation, and
//!   CommonName extraction
//! - **Pool credential**: salted Argon2id hash gating new-generation requests
//!
//! ## Trust Model
//!
//! | Mode | Server certificate | Client verification |
//! |------|--------------------|---------------------|
//! | Plaintext | Ephemeral, generated per process | None |
//! | TLS | Configured PEM chain | CA roots, server name = peer CommonName |
//! | TLS + skip | Configured PEM chain | None (development only) |
//!
//! QUIC always encrypts. Plaintext mode only means peers are not
//! authenticated, and status reports it as TLS inactive.
//!
//! ## SECURITY WARNING
//!
//! [`SkipServerVerification`] accepts any certificate for any name. It is
//! only installed when the operator passes `--dangerous-skip-tls-verify`,
//! or in plaintext mode where no identity is claimed at all.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use quinn::ClientConfig;
use rand::rngs::OsRng;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;

use crate::error::Error;

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier shared by peers and the discovery service.
pub const ALPN: &[u8] = b"pfsd";

/// Server name used when a peer advertises no CommonName.
pub const DEFAULT_SERVER_NAME: &str = "pfsd";

// ============================================================================
// Certificates
// ============================================================================

/// Certificate chain and private key presented by this node's listener.
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certs", &self.certs.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TlsIdentity {
    pub fn load_pem(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs = CertificateDer::pem_file_iter(cert_path)
            .with_context(|| format!("failed to open certificate {}", cert_path.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to parse certificate {}", cert_path.display()))?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found in {}", cert_path.display());
        }
        let key = PrivateKeyDer::from_pem_file(key_path)
            .with_context(|| format!("failed to load private key {}", key_path.display()))?;
        Ok(Self { certs, key })
    }

    /// Self-signed certificate for plaintext mode, valid for `common_name`.
    pub fn ephemeral(common_name: &str) -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()])
            .context("failed to create certificate params")?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let key_pair = rcgen::KeyPair::generate().context("failed to generate certificate key")?;
        let cert = params
            .self_signed(&key_pair)
            .context("failed to generate self-signed certificate")?;

        Ok(Self {
            certs: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// CommonName of the leaf certificate, if it has one.
    pub fn common_name(&self) -> Option<String> {
        self.certs.first().and_then(|c| common_name_from_cert(c.as_ref()))
    }
}

pub fn common_name_from_cert(cert_der: &[u8]) -> Option<String> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Trust anchors from a PEM bundle.
pub fn load_roots(ca_path: &Path) -> Result<RootCertStore> {
    let certs = CertificateDer::pem_file_iter(ca_path)
        .with_context(|| format!("failed to open CA bundle {}", ca_path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse CA bundle {}", ca_path.display()))?;
    roots_from(certs)
}

pub fn roots_from(certs: impl IntoIterator<Item = CertificateDer<'static>>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).context("invalid trust anchor")?;
    }
    if roots.is_empty() {
        anyhow::bail!("no trust anchors loaded");
    }
    Ok(roots)
}

// ============================================================================
// QUIC configuration
// ============================================================================

/// How a client checks the certificate presented by the server it dials.
#[derive(Clone)]
pub enum ServerVerification {
    Roots(Arc<RootCertStore>),
    Skip,
}

impl std::fmt::Debug for ServerVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerVerification::Roots(roots) => write!(f, "Roots({})", roots.len()),
            ServerVerification::Skip => f.write_str("Skip"),
        }
    }
}

pub fn create_server_config(identity: TlsIdentity) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS versions")?
        .with_no_client_auth()
        .with_single_cert(identity.certs, identity.key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .context("invalid idle timeout")?,
    ));
    transport.max_concurrent_bidi_streams(64u32.into());
    transport.max_concurrent_uni_streams(0u32.into());
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

pub fn create_client_config(verification: &ServerVerification) -> Result<ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS versions")?;

    let mut client_crypto = match verification {
        ServerVerification::Roots(roots) => builder
            .with_root_certificates(roots.clone())
            .with_no_client_auth(),
        ServerVerification::Skip => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth(),
    };
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .context("invalid idle timeout")?,
    ));
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(15)));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ============================================================================
// Pool credential
// ============================================================================

/// Optional salted password hash gating admission to the pool.
///
/// Stored as an Argon2id PHC string, which carries its own salt and
/// parameters. No hash means the pool is open.
#[derive(Clone, Default)]
pub struct PoolCredential {
    hash: Option<String>,
}

impl PoolCredential {
    pub fn open() -> Self {
        Self { hash: None }
    }

    /// Hash `password` under a fresh random salt.
    pub fn from_password(password: &str) -> Result<Self> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("failed to hash pool password: {}", e))?
            .to_string();
        Ok(Self { hash: Some(hash) })
    }

    /// Adopt an existing PHC hash string, checking that it parses.
    pub fn from_phc(phc: &str) -> Result<Self> {
        PasswordHash::new(phc).map_err(|e| anyhow::anyhow!("invalid pool password hash: {}", e))?;
        Ok(Self {
            hash: Some(phc.to_string()),
        })
    }

    pub fn is_protected(&self) -> bool {
        self.hash.is_some()
    }

    /// Admit or reject a caller-supplied password.
    ///
    /// A protected pool requires the matching password. An open pool
    /// requires the empty password, so a caller configured for a protected
    /// pool cannot silently join an open one.
    pub fn verify(&self, password: &str) -> Result<(), Error> {
        let Some(phc) = &self.hash else {
            return if password.is_empty() {
                Ok(())
            } else {
                Err(Error::invalid_argument("pool is not password protected"))
            };
        };

        if password.is_empty() {
            return Err(Error::invalid_argument("pool password required"));
        }

        let parsed = PasswordHash::new(phc)
            .map_err(|_| Error::invalid_argument("pool password hash is unusable"))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Error::invalid_argument("pool password mismatch"))
    }
}

impl std::fmt::Debug for PoolCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCredential")
            .field("protected", &self.is_protected())
            .finish()
    }
}
