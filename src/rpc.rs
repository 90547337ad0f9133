//! # RPC Layer
//!
//! QUIC request/response plumbing shared by the peer protocol and the
//! discovery client.
//!
//! ## Client
//!
//! - [`connect`] resolves an address and dials it with a bounded timeout,
//!   presenting `server_name` for certificate verification.
//! - [`call`] opens one bidirectional stream per request, writes a single
//!   frame, finishes the send side, and reads a single bounded frame back.
//!   The whole exchange is bounded by the caller's timeout. A remote
//!   `RpcResponse::Error` is returned as the `Error` it carries.
//!
//! ## Server
//!
//! - [`serve`] accepts connections until the quit token fires or the
//!   endpoint is closed.
//! - Every inbound stream is handled on its own task. Reads are bounded by
//!   `REQUEST_READ_TIMEOUT`, handler execution by `REQUEST_PROCESS_TIMEOUT`.
//! - Oversized, undecodable, or structurally invalid requests are answered
//!   with `Error::InvalidArgument`; a peer can never crash the process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::messages::{self, RpcRequest, RpcResponse, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE};
use crate::protocols::RequestHandler;

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Client
// ============================================================================

/// Dial `address` (`host:port`) within `timeout`.
pub async fn connect(
    endpoint: &Endpoint,
    client_config: &ClientConfig,
    address: &str,
    server_name: &str,
    timeout: Duration,
) -> Result<Connection, Error> {
    let dial = async {
        let addr = resolve(address).await?;
        let connecting = endpoint
            .connect_with(client_config.clone(), addr, server_name)
            .map_err(|e| Error::transport(format!("failed to initiate connection to {}: {}", address, e)))?;
        connecting
            .await
            .map_err(|e| Error::transport(format!("failed to establish connection to {}: {}", address, e)))
    };

    tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| Error::transport(format!("dial to {} timed out after {:?}", address, timeout)))?
}

async fn resolve(address: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| Error::transport(format!("failed to resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| Error::transport(format!("{} resolved to no addresses", address)))
}

/// Send one request over `conn` and wait at most `timeout` for its response.
pub async fn call(
    conn: &Connection,
    request: &RpcRequest,
    timeout: Duration,
) -> Result<RpcResponse, Error> {
    let exchange = async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| Error::transport(format!("failed to open stream: {}", e)))?;

        let request_bytes = messages::encode(request)
            .map_err(|e| Error::invalid_argument(format!("failed to encode request: {}", e)))?;
        messages::write_frame(&mut send, &request_bytes)
            .await
            .map_err(|e| Error::transport(format!("failed to send request: {}", e)))?;
        send.finish()
            .map_err(|e| Error::transport(format!("failed to finish request stream: {}", e)))?;

        let response_bytes = messages::read_frame(&mut recv, MAX_RESPONSE_SIZE)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(
                        peer = %conn.remote_address(),
                        error = %e,
                        "peer sent oversized response"
                    );
                }
                Error::transport(format!("failed to read response: {}", e))
            })?;

        messages::decode::<RpcResponse>(&response_bytes)
            .map_err(|e| Error::transport(format!("failed to decode response: {}", e)))
    };

    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::transport(format!("RPC timed out after {:?}", timeout)))??;

    match response {
        RpcResponse::Error(e) => Err(e),
        other => Ok(other),
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accept and serve inbound connections until `quit` fires or the endpoint
/// is closed.
pub async fn serve(endpoint: Endpoint, handler: Arc<dyn RequestHandler>, quit: CancellationToken) {
    let local = endpoint.local_addr().ok();
    info!(addr = ?local, "protocol listener started");

    loop {
        let incoming = tokio::select! {
            _ = quit.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            debug!("endpoint closed, listener exiting");
            break;
        };

        let handler = handler.clone();
        let quit = quit.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, handler, quit).await {
                debug!(error = %e, "connection ended with error");
            }
        });
    }

    info!(addr = ?local, "protocol listener stopped");
}

async fn handle_connection(
    incoming: Incoming,
    handler: Arc<dyn RequestHandler>,
    quit: CancellationToken,
) -> anyhow::Result<()> {
    let connection = incoming.await?;
    let remote = connection.remote_address();
    debug!(remote = %remote, "peer connected");

    loop {
        let stream = tokio::select! {
            _ = quit.cancelled() => break Ok(()),
            stream = connection.accept_bi() => stream,
        };
        let stream = match stream {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %remote, "connection closed");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(handler, stream, remote).await {
                debug!(remote = %remote, error = %e, "stream error");
            }
        });
    }
}

async fn handle_stream(
    handler: Arc<dyn RequestHandler>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote: SocketAddr,
) -> anyhow::Result<()> {
    let read = tokio::time::timeout(
        REQUEST_READ_TIMEOUT,
        messages::read_frame(&mut recv, MAX_REQUEST_SIZE),
    )
    .await
    .map_err(|_| anyhow::anyhow!("request read timed out"))?;

    let response = match read {
        Ok(bytes) => dispatch(&handler, &bytes, remote).await,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            warn!(remote = %remote, error = %e, "rejecting oversized request");
            RpcResponse::Error(Error::invalid_argument(e.to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let response_bytes = messages::encode(&response)?;
    messages::write_frame(&mut send, &response_bytes).await?;
    send.finish()?;
    Ok(())
}

async fn dispatch(handler: &Arc<dyn RequestHandler>, bytes: &[u8], remote: SocketAddr) -> RpcResponse {
    let request: RpcRequest = match messages::decode(bytes) {
        Ok(r) => r,
        Err(e) => {
            debug!(remote = %remote, error = %e, "undecodable request");
            return RpcResponse::Error(Error::invalid_argument("malformed request"));
        }
    };

    if let Err(e) = request.validate() {
        debug!(remote = %remote, error = %e, "invalid request");
        return RpcResponse::Error(e);
    }

    trace!(remote = %remote, request = ?request, "dispatching request");

    match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, handler.handle(request, remote)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            RpcResponse::Error(Error::transport("request processing timeout"))
        }
    }
}
