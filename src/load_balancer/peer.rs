//! Peer abstraction.
//!
//! # Responsibilities
//! - Represent a single backend address with its balancing policy
//! - Track weights mutated by the selection algorithm
//! - Track passive health (fails, last failure, last check)
//! - Track live connections (for max_conns and least_conn)
//! - Own the TLS session-resumption store for this peer

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::client::{ClientSessionMemoryCache, Resumption};
use rustls::ClientConfig;
use tokio::time::Instant;

use crate::config::ServerConfig;

/// A single backend address.
///
/// Identity and policy are immutable. Weight fields are atomics so that
/// selection can run under the set's read lock; `fails` and `accessed` are
/// only written under the write lock.
#[derive(Debug)]
pub struct Peer {
    /// Configured server name ("host:port"); several peers share it when the
    /// name resolves to several addresses.
    pub name: String,
    pub addr: SocketAddr,
    pub weight: i64,
    pub max_fails: u32,
    pub fail_timeout: Duration,
    pub max_conns: usize,
    pub down: bool,

    pub(crate) current_weight: AtomicI64,
    pub(crate) effective_weight: AtomicI64,
    pub(crate) conns: AtomicUsize,
    /// Milliseconds since the set epoch of the last check or failure.
    pub(crate) checked: AtomicU64,
    pub(crate) fails: u32,
    /// Time of the last failure.
    pub(crate) accessed: Option<Instant>,

    tls: OnceLock<Arc<ClientConfig>>,
}

impl Peer {
    /// Create a peer for one resolved address of `server`.
    pub fn new(name: impl Into<String>, addr: SocketAddr, server: &ServerConfig) -> Self {
        let weight = i64::from(server.weight.max(1));
        Self {
            name: name.into(),
            addr,
            weight,
            max_fails: server.max_fails,
            fail_timeout: server.fail_timeout(),
            max_conns: server.max_conns,
            down: server.down,
            current_weight: AtomicI64::new(0),
            effective_weight: AtomicI64::new(weight),
            conns: AtomicUsize::new(0),
            checked: AtomicU64::new(0),
            fails: 0,
            accessed: None,
            tls: OnceLock::new(),
        }
    }

    pub fn current_weight(&self) -> i64 {
        self.current_weight.load(Ordering::Relaxed)
    }

    pub fn effective_weight(&self) -> i64 {
        self.effective_weight.load(Ordering::Relaxed)
    }

    /// Number of live connections to this peer.
    pub fn conns(&self) -> usize {
        self.conns.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> u32 {
        self.fails
    }

    /// Whether failures have disabled the peer at `now_ms` (set epoch based).
    pub(crate) fn is_failed(&self, now_ms: u64) -> bool {
        self.max_fails > 0
            && self.fails >= self.max_fails
            && now_ms.saturating_sub(self.checked.load(Ordering::Relaxed))
                <= duration_ms(self.fail_timeout)
    }

    /// Whether the peer is at its connection limit.
    pub(crate) fn is_saturated(&self) -> bool {
        self.max_conns > 0 && self.conns() >= self.max_conns
    }

    /// Selectable at `now_ms` unless down, failed or saturated.
    pub(crate) fn is_available(&self, now_ms: u64) -> bool {
        !self.down && !self.is_failed(now_ms) && !self.is_saturated()
    }

    /// Restart the failure window once it has elapsed, so a recovering
    /// peer receives a single probe per window.
    pub(crate) fn touch_checked(&self, now_ms: u64) {
        let checked = self.checked.load(Ordering::Relaxed);
        if now_ms.saturating_sub(checked) > duration_ms(self.fail_timeout) {
            self.checked.store(now_ms, Ordering::Relaxed);
        }
    }

    /// Client TLS config carrying this peer's own resumption store.
    pub fn tls_config(&self, base: &Arc<ClientConfig>, cache_size: usize) -> Arc<ClientConfig> {
        self.tls
            .get_or_init(|| {
                let mut config = (**base).clone();
                config.resumption =
                    Resumption::store(Arc::new(ClientSessionMemoryCache::new(cache_size.max(1))));
                Arc::new(config)
            })
            .clone()
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
