//! # Upgraded Transports
//!
//! The boundary with the HTTP layer. The handshake happens elsewhere; this
//! module receives the raw duplex stream together with the request that was
//! upgraded and hands both to the [`Host`].

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::core::close::CloseCode;
use crate::error::constants::REASON_SHUTDOWN;
use crate::error::Result;
use crate::protocol::connection::Connection;
use crate::protocol::host::Host;

/// The parts of the upgrade request the engine keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub peer_addr: Option<SocketAddr>,
}

impl UpgradeRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// First subprotocol offered in `Sec-WebSocket-Protocol`.
    pub fn protocol(&self) -> Option<&str> {
        self.header("sec-websocket-protocol")
            .and_then(|list| list.split(',').map(str::trim).find(|p| !p.is_empty()))
    }
}

/// A transport whose handshake response has already been sent.
#[derive(Debug)]
pub struct Upgraded<T> {
    pub io: T,
    pub request: UpgradeRequest,
}

impl<T> Upgraded<T> {
    pub fn new(io: T, request: UpgradeRequest) -> Self {
        Self { io, request }
    }
}

/// Attach every transport arriving on `incoming` until shutdown.
///
/// Shutdown starts when `shutdown_rx` yields or its sender is dropped, or when
/// `incoming` closes. Every connection is then closed with 1001 and the call
/// waits up to `server.shutdown_timeout` for the drivers to finish.
#[instrument(skip_all)]
pub async fn serve<T, F>(
    host: Host,
    mut incoming: mpsc::Receiver<Upgraded<T>>,
    mut shutdown_rx: mpsc::Receiver<()>,
    mut on_connection: F,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnMut(Connection),
{
    info!("Accepting upgraded connections");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down. Closing connections...");
                break;
            }
            upgraded = incoming.recv() => match upgraded {
                Some(Upgraded { io, request }) => match host.accept(io, request) {
                    Ok(connection) => on_connection(connection),
                    Err(e) => warn!(error = %e, "Rejected upgraded transport"),
                },
                None => {
                    info!("Upgrade source closed, shutting down");
                    break;
                }
            }
        }
    }

    host.close_all(CloseCode::GOING_AWAY, REASON_SHUTDOWN);
    let timeout = host.config().server.shutdown_timeout;
    if host.wait_idle(timeout).await {
        info!("All connections closed");
    } else {
        warn!(remaining = host.live_drivers(), "Shutdown timeout reached, forcing exit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let req = UpgradeRequest::new("/chat").with_header("Sec-WebSocket-Protocol", "chat, superchat");
        assert_eq!(req.header("sec-websocket-protocol"), Some("chat, superchat"));
        assert_eq!(req.protocol(), Some("chat"));
        assert_eq!(req.header("origin"), None);
    }
}
