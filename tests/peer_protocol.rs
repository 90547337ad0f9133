//! Integration tests for the peer protocol.
//!
//! Each test starts real daemons on loopback QUIC endpoints inside their own
//! temporary filesystem directories and talks to them through the public
//! client half of the protocol.

use std::path::Path;
use std::time::Duration;

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use tempfile::TempDir;
use tokio::time::timeout;
use uuid::Uuid;

use pfsd::protocols::PeerRpc;
use pfsd::{
    CertVerification, Collaborators, Config, Daemon, ErrorKind, KeyPiece, Node, TransportSecurity,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback_config(dir: &Path) -> Config {
    let mut config = Config::new(dir);
    config.bind = "127.0.0.1:0".parse().unwrap();
    config
}

async fn start(dir: &TempDir) -> Daemon {
    Daemon::start(loopback_config(dir.path()), Collaborators::default())
        .await
        .expect("daemon start failed")
}

fn piece(seq: i64) -> KeyPiece {
    KeyPiece {
        data: vec![seq as u8; 16],
        parent_fingerprint: [3u8; 32],
        prime: vec![0xFF, 0xFB],
        seq,
    }
}

#[tokio::test]
async fn ping_registers_caller_with_remote() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = start(&dir_a).await;
    let b = start(&dir_b).await;

    let peers = a.peers().expect("networking is on");
    timeout(TEST_TIMEOUT, peers.ping(b.self_node()))
        .await
        .expect("ping timed out")
        .expect("ping failed");

    let seen = b.registry().get_node(&a.uuid()).await.expect("caller not registered");
    assert_eq!(&seen, a.self_node());
    assert_eq!(peers.consecutive_failures(b.self_node()).await, 0);
    assert_eq!(peers.peers().await, vec![b.self_node().address()]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn new_generation_then_missing_piece() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = start(&dir_a).await;
    let b = start(&dir_b).await;
    let peers = a.peers().unwrap();

    let (generation, _) = timeout(TEST_TIMEOUT, peers.new_generation(b.self_node(), ""))
        .await
        .unwrap()
        .expect("open pool must grant a generation");
    assert_eq!(generation, 1);

    let err = peers
        .request_key_piece(b.self_node(), generation)
        .await
        .expect_err("no piece was stored");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // The NotFound reply must not cost us the connection.
    peers.ping(b.self_node()).await.expect("connection should be reusable");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn stored_piece_is_served_to_its_owner() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = start(&dir_a).await;
    let b = start(&dir_b).await;

    b.key_pieces().add_piece(4, a.uuid(), piece(2)).await.unwrap();

    a.peers().unwrap().ping(b.self_node()).await.unwrap();
    b.peers().unwrap().ping(a.self_node()).await.unwrap();

    let fetched = timeout(TEST_TIMEOUT, a.request_key_piece(&b.uuid(), 4))
        .await
        .unwrap()
        .expect("piece should be served");
    assert_eq!(fetched, piece(2));

    let err = a.request_key_piece(&b.uuid(), 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn request_for_unknown_node_is_not_found() {
    let dir = TempDir::new().unwrap();
    let daemon = start(&dir).await;

    let err = daemon.request_key_piece(&Uuid::new_v4(), 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    daemon.shutdown().await;
}

#[tokio::test]
async fn protected_pool_gates_new_generation() {
    let salt = SaltString::generate(&mut OsRng);
    let phc = Argon2::default()
        .hash_password(b"correct horse", &salt)
        .unwrap()
        .to_string();

    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = start(&dir_a).await;
    let mut config = loopback_config(dir_b.path());
    config.pool_password_hash = Some(phc);
    let b = Daemon::start(config, Collaborators::default()).await.unwrap();
    let peers = a.peers().unwrap();

    for wrong in ["", "battery staple"] {
        let err = peers.new_generation(b.self_node(), wrong).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "password {:?}", wrong);
    }

    let (generation, _) = peers
        .new_generation(b.self_node(), "correct horse")
        .await
        .expect("matching password must be admitted");
    assert_eq!(generation, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn restart_keeps_identity_and_generation_counter() {
    let dir = TempDir::new().unwrap();
    let first = start(&dir).await;
    let uuid = first.uuid();
    first.key_pieces().add_piece(7, Uuid::new_v4(), piece(1)).await.unwrap();
    first.shutdown().await;
    drop(first);

    let second = start(&dir).await;
    assert_eq!(second.uuid(), uuid);
    assert_eq!(second.key_pieces().generations().await, vec![7]);

    let caller_dir = TempDir::new().unwrap();
    let caller = start(&caller_dir).await;
    let (generation, _) = caller
        .peers()
        .unwrap()
        .new_generation(second.self_node(), "")
        .await
        .unwrap();
    assert_eq!(generation, 8);

    caller.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_is_evicted_after_repeated_failures() {
    let dir = TempDir::new().unwrap();
    let mut config = loopback_config(dir.path());
    config.ping_interval = Duration::from_millis(20);
    let daemon = Daemon::start(config, Collaborators::default()).await.unwrap();

    // A name no certificate can match, so every dial fails at once.
    let ghost = Node::new("127.0.0.1", 9, "not a host name", Uuid::new_v4());
    daemon.registry().add(ghost.clone()).await;

    let evicted = timeout(TEST_TIMEOUT, async {
        while daemon.registry().get_node(&ghost.uuid).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "ghost peer was never evicted");

    let peers = daemon.peers().unwrap();
    assert_eq!(peers.consecutive_failures(&ghost).await, 0);

    daemon.shutdown().await;
}

// ============================================================================
// TLS
// ============================================================================

fn write_identity(dir: &Path, name: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    let cert = dir.join(format!("{}.crt", name));
    let key = dir.join(format!("{}.key", name));
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
    (cert, key)
}

fn tls_config(dir: &Path, cert: &Path, key: &Path, name: &str) -> Config {
    let mut config = loopback_config(dir);
    config.common_name = Some(name.to_string());
    config.security = TransportSecurity::Tls {
        cert: cert.to_path_buf(),
        key: key.to_path_buf(),
        ca: None,
        verification: CertVerification::Verify,
    };
    config
}

#[tokio::test]
async fn tls_nodes_sharing_a_certificate_interoperate() {
    let certs = TempDir::new().unwrap();
    let (cert, key) = write_identity(certs.path(), "pool.pfsd");

    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = Daemon::start(tls_config(dir_a.path(), &cert, &key, "pool.pfsd"), Collaborators::default())
        .await
        .unwrap();
    let b = Daemon::start(tls_config(dir_b.path(), &cert, &key, "pool.pfsd"), Collaborators::default())
        .await
        .unwrap();
    assert!(a.tls_active() && b.tls_active());
    assert_eq!(b.self_node().common_name, "pool.pfsd");

    timeout(TEST_TIMEOUT, a.peers().unwrap().ping(b.self_node()))
        .await
        .unwrap()
        .expect("verified TLS ping failed");
    assert!(b.registry().get_node(&a.uuid()).await.is_ok());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn tls_rejects_untrusted_peer_certificate() {
    let certs = TempDir::new().unwrap();
    let (cert_a, key_a) = write_identity(certs.path(), "alpha.pfsd");
    let (cert_b, key_b) = write_identity(certs.path(), "beta.pfsd");

    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = Daemon::start(tls_config(dir_a.path(), &cert_a, &key_a, "alpha.pfsd"), Collaborators::default())
        .await
        .unwrap();
    let b = Daemon::start(tls_config(dir_b.path(), &cert_b, &key_b, "beta.pfsd"), Collaborators::default())
        .await
        .unwrap();

    let err = timeout(TEST_TIMEOUT, a.peers().unwrap().ping(b.self_node()))
        .await
        .unwrap()
        .expect_err("untrusted certificate must be rejected");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(b.registry().is_empty().await);

    a.shutdown().await;
    b.shutdown().await;
}
