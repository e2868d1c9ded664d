//! Transport connector.
//!
//! # Responsibilities
//! - Open a non-blocking TCP connection to a peer address
//! - Optionally upgrade it to TLS, verifying the peer certificate
//! - Report failures as connect-class or TLS errors for classification
//!
//! # Design Decisions
//! - The connect timeout is applied by the caller as an absolute deadline
//! - TLS session resumption is per peer (`Peer::tls_config`)

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;

use crate::load_balancer::SelectedPeer;
use crate::upstream::{Connection, UpstreamError};

/// Opens connections to selected peers.
#[async_trait]
pub trait Connect: Send + Sync + fmt::Debug {
    async fn connect(&self, peer: &SelectedPeer) -> Result<Connection, UpstreamError>;
}

/// TLS settings shared by every peer of an upstream.
#[derive(Clone)]
pub struct TlsSettings {
    pub base: Arc<ClientConfig>,
    /// Overrides the host part of the server name.
    pub server_name: Option<String>,
    pub session_cache_size: usize,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .field("session_cache_size", &self.session_cache_size)
            .finish_non_exhaustive()
    }
}

/// TCP connector with optional TLS upgrade.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    tls: Option<TlsSettings>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(tls: TlsSettings) -> Self {
        Self { tls: Some(tls) }
    }

    async fn open(addr: SocketAddr) -> Result<tokio::net::TcpStream, io::Error> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Host part of a configured "host:port" server name.
fn host_of(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match name.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => name,
    }
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self, peer: &SelectedPeer) -> Result<Connection, UpstreamError> {
        let addr = peer.addr();
        let stream = Self::open(addr)
            .await
            .map_err(|source| UpstreamError::Connect { addr, source })?;

        let Some(tls) = &self.tls else {
            tracing::debug!(peer = %peer.name(), addr = %addr, "Connected to upstream");
            return Ok(Connection::new(addr, stream));
        };

        let host = tls.server_name.clone().unwrap_or_else(|| host_of(peer.name()).to_string());
        let server_name = ServerName::try_from(host).map_err(|e| UpstreamError::Tls {
            addr,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let config = peer.with_peer(|p| p.tls_config(&tls.base, tls.session_cache_size));
        let stream = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|source| UpstreamError::Tls { addr, source })?;

        tracing::debug!(peer = %peer.name(), addr = %addr, "Connected to upstream over TLS");
        Ok(Connection::new(addr, stream))
    }
}
