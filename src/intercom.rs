//! # Intercom
//!
//! Local-only operator interface on a Unix-domain socket at
//! `meta/intercom.sock`. Command-line tooling uses it to probe liveness,
//! read status, and list cluster nodes.
//!
//! - Frames use the same length-prefixed bincode encoding as the peer
//!   protocol. One connection may carry many requests.
//! - The socket file is created with mode `0600`. A stale file left by a
//!   crashed process is removed before binding.
//! - The accept loop stops on [`IntercomServer::stop_accept`], not on the
//!   daemon's quit signal, so status stays readable during teardown until
//!   its own step.
//! - `Status` always succeeds. With networking disabled it reports the
//!   degraded state rather than failing.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::identity::Node;
use crate::messages::{self, IntercomRequest, IntercomResponse, StatusReport, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE};
use crate::protocols::Consensus;

/// Socket file name inside the metadata directory.
pub const INTERCOM_SOCKET: &str = "intercom.sock";

/// Status text reported when the node runs without networking.
pub const STATUS_NETWORKING_DISABLED: &str = "Networking disabled";

/// What the intercom reports about the running daemon.
pub struct IntercomState {
    pub started: Instant,
    pub network_off: bool,
    pub tls_active: bool,
    pub port: u16,
    pub consensus: Option<Arc<dyn Consensus>>,
}

impl IntercomState {
    pub fn status(&self) -> StatusReport {
        let status = match (&self.consensus, self.network_off) {
            (_, true) => STATUS_NETWORKING_DISABLED.to_string(),
            (Some(consensus), false) => consensus.role().to_string(),
            (None, false) => crate::protocols::ConsensusRole::Inactive.to_string(),
        };
        StatusReport {
            uptime_secs: self.started.elapsed().as_secs(),
            status,
            tls_active: self.tls_active,
            port: self.port,
        }
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        match &self.consensus {
            Some(consensus) if !self.network_off => Ok(consensus.peers().await),
            _ => Err(Error::unknown("Networking Disabled")),
        }
    }

    async fn answer(&self, request: IntercomRequest) -> IntercomResponse {
        match request {
            IntercomRequest::ConfirmUp => IntercomResponse::Up,
            IntercomRequest::Status => IntercomResponse::Status(self.status()),
            IntercomRequest::ListNodes => match self.list_nodes().await {
                Ok(nodes) => IntercomResponse::Nodes(nodes),
                Err(e) => IntercomResponse::Error(e),
            },
        }
    }
}

/// Handle used to stop the intercom and clean up its socket.
pub struct IntercomServer {
    path: PathBuf,
    stop: CancellationToken,
}

/// Accept loop of a bound intercom socket.
pub struct IntercomListener {
    listener: UnixListener,
    state: Arc<IntercomState>,
    stop: CancellationToken,
}

impl IntercomServer {
    pub fn bind(path: &Path, state: Arc<IntercomState>) -> anyhow::Result<(Self, IntercomListener)> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale intercom socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove stale socket {}", path.display()));
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind intercom socket {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict intercom socket {}", path.display()))?;
        info!(path = %path.display(), "intercom listening");

        let stop = CancellationToken::new();
        Ok((
            Self {
                path: path.to_path_buf(),
                stop: stop.clone(),
            },
            IntercomListener {
                listener,
                state,
                stop,
            },
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections, end open sessions, and remove the socket.
    pub fn stop_accept(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove intercom socket");
        }
        info!("intercom stopped accepting connections");
    }
}

impl IntercomListener {
    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let state = self.state.clone();
                    let stop = self.stop.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_session(stream, state, stop).await {
                            debug!(error = %e, "intercom session ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "intercom accept failed");
                }
            }
        }
        debug!("intercom accept loop exited");
    }
}

async fn serve_session(
    mut stream: UnixStream,
    state: Arc<IntercomState>,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            read = messages::read_frame(&mut stream, MAX_REQUEST_SIZE) => read,
        };
        let bytes = match read {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let response = match messages::decode::<IntercomRequest>(&bytes) {
            Ok(request) => state.answer(request).await,
            Err(_) => IntercomResponse::Error(Error::invalid_argument("malformed intercom request")),
        };
        messages::write_frame(&mut stream, &messages::encode(&response)?).await?;
    }
}

/// Client side of the intercom, for operator tooling.
pub struct IntercomClient {
    stream: UnixStream,
}

impl IntercomClient {
    pub async fn connect(path: &Path) -> Result<Self, Error> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| Error::transport(format!("failed to connect to {}: {}", path.display(), e)))?;
        Ok(Self { stream })
    }

    pub async fn confirm_up(&mut self) -> Result<(), Error> {
        match self.request(IntercomRequest::ConfirmUp).await? {
            IntercomResponse::Up => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&mut self) -> Result<StatusReport, Error> {
        match self.request(IntercomRequest::Status).await? {
            IntercomResponse::Status(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_nodes(&mut self) -> Result<Vec<Node>, Error> {
        match self.request(IntercomRequest::ListNodes).await? {
            IntercomResponse::Nodes(nodes) => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&mut self, request: IntercomRequest) -> Result<IntercomResponse, Error> {
        let bytes = messages::encode(&request)
            .map_err(|e| Error::invalid_argument(format!("failed to encode request: {}", e)))?;
        messages::write_frame(&mut self.stream, &bytes)
            .await
            .map_err(|e| Error::transport(format!("intercom write failed: {}", e)))?;
        let response = messages::read_frame(&mut self.stream, MAX_RESPONSE_SIZE)
            .await
            .map_err(|e| Error::transport(format!("intercom read failed: {}", e)))?;
        messages::decode(&response)
            .map_err(|e| Error::transport(format!("malformed intercom response: {}", e)))
    }
}

fn unexpected(response: IntercomResponse) -> Error {
    match response {
        IntercomResponse::Error(e) => e,
        other => Error::transport(format!("unexpected intercom response: {:?}", other)),
    }
}
