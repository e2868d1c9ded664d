//! Upstream registry.
//!
//! # Responsibilities
//! - Build every configured upstream: resolved peers, pool, connector, policies
//! - Swap the whole set atomically on reload
//!
//! # Design Decisions
//! - Sessions hold the `Arc<Upstream>` they started with; a reload never
//!   disturbs them
//! - Replaced upstreams have their keepalive pools shut down

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{BufferingConfig, KeepaliveConfig, ProxyConfig, RetryConfig, ServerConfig, UpstreamConfig};
use crate::load_balancer::{Peer, PeerSet, PeerSnapshot, UpstreamPeers};
use crate::net::tls::load_client_config;
use crate::resilience::{PhaseTimeouts, RetryPolicy};
use crate::upstream::connector::TlsSettings;
use crate::upstream::keepalive::KeepaliveSettings;
use crate::upstream::relay::RelaySettings;
use crate::upstream::{Connect, ConnectionPool, TcpConnector};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot resolve upstream server \"{address}\": {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream server \"{0}\" resolved to no addresses")]
    NoAddress(String),

    #[error("upstream \"{upstream}\" TLS setup failed: {source}")]
    Tls {
        upstream: String,
        #[source]
        source: io::Error,
    },
}

/// One upstream group and every policy a session needs.
#[derive(Debug)]
pub struct Upstream {
    pub name: String,
    pub peers: UpstreamPeers,
    pub pool: ConnectionPool,
    pub connector: Arc<dyn Connect>,
    pub timeouts: PhaseTimeouts,
    pub retry: RetryPolicy,
    pub relay: RelaySettings,
    pub header_buffer_size: usize,
}

impl Upstream {
    /// An upstream with default policies over already built peers.
    pub fn new(name: impl Into<String>, peers: UpstreamPeers, connector: Arc<dyn Connect>) -> Self {
        let name = name.into();
        let buffering = BufferingConfig::default();
        Self {
            pool: ConnectionPool::new(name.clone(), KeepaliveSettings::from_config(&KeepaliveConfig::default())),
            retry: RetryPolicy::from_config(&RetryConfig::default(), peers.len()),
            name,
            peers,
            connector,
            timeouts: PhaseTimeouts::default(),
            relay: RelaySettings::from_config(&buffering),
            header_buffer_size: buffering.header_buffer_size,
        }
    }

    /// Resolve the configured servers and build the upstream.
    pub async fn from_config(config: &UpstreamConfig) -> Result<Self, RegistryError> {
        let mut primary = Vec::new();
        let mut backup = Vec::new();
        for server in &config.servers {
            let peers = resolve(server).await?;
            if server.backup {
                backup.extend(peers);
            } else {
                primary.extend(peers);
            }
        }

        let backup = (!backup.is_empty()).then(|| PeerSet::new(&config.name, backup, true, config.balance));
        let peers = UpstreamPeers::new(PeerSet::new(&config.name, primary, false, config.balance), backup);

        let connector: Arc<dyn Connect> = match &config.tls {
            Some(tls) => {
                let base = load_client_config(tls).map_err(|source| RegistryError::Tls {
                    upstream: config.name.clone(),
                    source,
                })?;
                Arc::new(TcpConnector::with_tls(TlsSettings {
                    base,
                    server_name: tls.server_name.clone(),
                    session_cache_size: tls.session_cache_size,
                }))
            }
            None => Arc::new(TcpConnector::new()),
        };

        tracing::info!(
            upstream = %config.name,
            peers = peers.len(),
            balance = ?config.balance,
            keepalive = config.keepalive.capacity,
            tls = config.tls.is_some(),
            "Upstream configured"
        );

        Ok(Self {
            name: config.name.clone(),
            retry: RetryPolicy::from_config(&config.retry, peers.len()),
            peers,
            pool: ConnectionPool::new(&config.name, KeepaliveSettings::from_config(&config.keepalive)),
            connector,
            timeouts: PhaseTimeouts::from_config(&config.timeouts),
            relay: RelaySettings::from_config(&config.buffering),
            header_buffer_size: config.buffering.header_buffer_size,
        })
    }

    pub fn snapshot(&self) -> UpstreamSnapshot {
        UpstreamSnapshot {
            name: self.name.clone(),
            peers: self.peers.snapshot(Instant::now()),
            keepalive_idle: self.pool.idle_count(),
        }
    }
}

/// One peer per resolved address, all sharing the configured name.
async fn resolve(server: &ServerConfig) -> Result<Vec<Peer>, RegistryError> {
    let addrs: Vec<_> = tokio::net::lookup_host(server.address.as_str())
        .await
        .map_err(|source| RegistryError::Resolve {
            address: server.address.clone(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(RegistryError::NoAddress(server.address.clone()));
    }
    Ok(addrs
        .into_iter()
        .map(|addr| Peer::new(server.address.clone(), addr, server))
        .collect())
}

/// Status view of one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSnapshot {
    pub name: String,
    pub peers: Vec<PeerSnapshot>,
    pub keepalive_idle: usize,
}

type UpstreamMap = HashMap<String, Arc<Upstream>>;

/// Every configured upstream, replaced as a whole on reload.
#[derive(Debug)]
pub struct UpstreamRegistry {
    upstreams: ArcSwap<UpstreamMap>,
}

impl UpstreamRegistry {
    pub fn empty() -> Self {
        Self {
            upstreams: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub async fn from_config(config: &ProxyConfig) -> Result<Self, RegistryError> {
        Ok(Self {
            upstreams: ArcSwap::from_pointee(build(config).await?),
        })
    }

    /// Register a prebuilt upstream, replacing one with the same name.
    pub fn insert(&self, upstream: Upstream) {
        let upstream = Arc::new(upstream);
        self.upstreams.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(upstream.name.clone(), Arc::clone(&upstream));
            next
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.upstreams.load().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.upstreams.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Rebuild from `config` and swap. On error the current set stays.
    pub async fn reload(&self, config: &ProxyConfig) -> Result<(), RegistryError> {
        let next = build(config).await?;
        let previous = self.upstreams.swap(Arc::new(next));
        for upstream in previous.values() {
            upstream.pool.shutdown();
        }
        tracing::info!(upstreams = self.upstreams.load().len(), "Upstream registry reloaded");
        Ok(())
    }

    /// Close every cached connection and stop caching new ones.
    pub fn shutdown_pools(&self) {
        for upstream in self.upstreams.load().values() {
            upstream.pool.shutdown();
        }
    }

    pub fn snapshot(&self) -> Vec<UpstreamSnapshot> {
        let mut all: Vec<_> = self.upstreams.load().values().map(|u| u.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

async fn build(config: &ProxyConfig) -> Result<UpstreamMap, RegistryError> {
    let mut map = HashMap::new();
    for upstream in &config.upstreams {
        map.insert(upstream.name.clone(), Arc::new(Upstream::from_config(upstream).await?));
    }
    Ok(map)
}
