//! Downstream HTTP/1.1 front-end.
//!
//! # Responsibilities
//! - Accept client connections under the listener's connection limit
//! - Read one request, route it and hand it to an upstream session
//! - Cancel the session when the client goes away
//! - Answer with a synthesized error when nothing was relayed
//! - Stop accepting on shutdown and drain open connections
//!
//! # Design Decisions
//! - One request per client connection; the relayed response header is not
//!   rewritten, so the connection is closed after it
//! - Routes, config and upstreams are swapped together on reload; running
//!   sessions keep the upstream they started with

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::request::{read_request, RequestLimits};
use crate::http::response::write_error;
use crate::net::{ConnectionPermit, ConnectionTracker, Listener, ListenerError};
use crate::observability::tracing::{session_id, session_span};
use crate::routing::{RouteTarget, Router};
use crate::upstream::registry::RegistryError;
use crate::upstream::{CancelHandle, SessionReport, UpstreamRegistry, UpstreamSession};

/// Session reports kept for the admin API.
const RECENT_SESSIONS: usize = 64;

const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

struct StateInner {
    config: ArcSwap<ProxyConfig>,
    routes: ArcSwap<Router>,
    registry: UpstreamRegistry,
    tracker: ConnectionTracker,
    started: Instant,
    recent: Mutex<VecDeque<SessionReport>>,
}

/// Shared proxy state, cheap to clone into every connection task.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

impl AppState {
    /// Build upstreams and routes from `config`.
    pub async fn from_config(config: ProxyConfig) -> Result<Self, RegistryError> {
        let registry = UpstreamRegistry::from_config(&config).await?;
        Ok(Self::with_registry(config, registry))
    }

    /// Use an already populated registry; routes still come from `config`.
    pub fn with_registry(config: ProxyConfig, registry: UpstreamRegistry) -> Self {
        Self {
            inner: Arc::new(StateInner {
                routes: ArcSwap::from_pointee(Router::from_config(&config.routes)),
                config: ArcSwap::from_pointee(config),
                registry,
                tracker: ConnectionTracker::new(),
                started: Instant::now(),
                recent: Mutex::new(VecDeque::with_capacity(RECENT_SESSIONS)),
            }),
        }
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.inner.config.load_full()
    }

    pub fn registry(&self) -> &UpstreamRegistry {
        &self.inner.registry
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.inner.tracker
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Upstream name for the first matching route.
    pub fn route(&self, target: &RouteTarget<'_>) -> Option<String> {
        self.inner.routes.load().route(target).map(|r| r.upstream.clone())
    }

    /// Apply a new configuration. On error nothing changes.
    pub async fn reload(&self, config: ProxyConfig) -> Result<(), RegistryError> {
        self.inner.registry.reload(&config).await?;
        self.inner.routes.store(Arc::new(Router::from_config(&config.routes)));
        self.inner.config.store(Arc::new(config));
        Ok(())
    }

    pub fn record(&self, report: SessionReport) {
        let mut recent = self.inner.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_SESSIONS {
            recent.pop_front();
        }
        recent.push_back(report);
    }

    /// Most recent first.
    pub fn recent_sessions(&self) -> Vec<SessionReport> {
        let recent = self.inner.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.iter().rev().cloned().collect()
    }
}

/// HTTP server for the proxy.
pub struct HttpServer {
    listener: Listener,
    state: AppState,
}

impl HttpServer {
    pub fn new(listener: Listener, state: AppState) -> Self {
        Self { listener, state }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires, then wait for open connections up to
    /// the configured drain timeout.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        tracing::info!(
            address = ?self.listener.local_addr().ok(),
            max_connections = self.listener.max_connections(),
            "HTTP server starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let state = self.state.clone();
                        tokio::spawn(handle_connection(state, stream, peer, permit));
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        let drain = Duration::from_millis(self.state.config().listener.drain_timeout_ms);
        tracing::info!(
            active = self.state.tracker().active_count(),
            drain_timeout = ?drain,
            "HTTP server stopped accepting, draining"
        );
        if !self.state.tracker().wait_idle(drain).await {
            tracing::warn!(
                active = self.state.tracker().active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn handle_connection(state: AppState, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
    let _permit = permit;
    let guard = state.tracker().track();
    let (mut reader, mut writer) = stream.into_split();

    let limits = RequestLimits::from_config(&state.config().listener);
    let request = match read_request(&mut reader, &limits).await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "Rejected request");
            if let Some(status) = e.status() {
                write_error(&mut writer, status, None).await;
                let _ = writer.shutdown().await;
                linger(reader).await;
            }
            return;
        }
    };

    let id = session_id(&request.headers);
    let target = RouteTarget::new(request.host(), request.path());
    let Some(upstream_name) = state.route(&target) else {
        tracing::warn!(session_id = %id, host = ?request.host(), path = %request.path(), "No route matched");
        write_error(&mut writer, StatusCode::NOT_FOUND, Some(id)).await;
        return;
    };
    let Some(upstream) = state.registry().get(&upstream_name) else {
        tracing::error!(session_id = %id, upstream = %upstream_name, "Route points at unknown upstream");
        write_error(&mut writer, StatusCode::BAD_GATEWAY, Some(id)).await;
        return;
    };

    let span = session_span(id, &upstream_name, &request.method, &request.uri);
    async move {
        let (session, cancel) = match UpstreamSession::start(upstream, request.into_protocol()) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "Cannot start upstream session");
                write_error(&mut writer, StatusCode::INTERNAL_SERVER_ERROR, Some(id)).await;
                return;
            }
        };

        let watcher = tokio::spawn(watch_client(reader, cancel));
        let report = session.with_id(id).drive(&mut writer).await;
        watcher.abort();

        if !report.header_delivered && !report.cancelled {
            let status = StatusCode::from_u16(report.status).unwrap_or(StatusCode::BAD_GATEWAY);
            write_error(&mut writer, status, Some(id)).await;
        }
        let _ = writer.shutdown().await;
        state.record(report);
    }
    .instrument(span)
    .await
}

/// Discard unread request bytes for a while so closing does not reset the
/// connection before the client reads the error response.
async fn linger(mut reader: OwnedReadHalf) {
    let mut buf = [0u8; 4096];
    let _ = tokio::time::timeout(LINGER_TIMEOUT, async {
        while matches!(reader.read(&mut buf).await, Ok(n) if n > 0) {}
    })
    .await;
}

/// Cancel the session once the client closes its side.
async fn watch_client(mut reader: OwnedReadHalf, cancel: CancelHandle) {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                tracing::debug!("Client closed connection");
                cancel.cancel();
                return;
            }
            Ok(_) => continue,
        }
    }
}
