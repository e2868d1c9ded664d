//! Peer set management.
//!
//! # Responsibilities
//! - Hold the peers of one upstream (primary and backup sets)
//! - Apply the configured load balancing algorithm
//! - Hand out SelectedPeer guards that track live connections

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BalanceMethod;
use crate::health::PeerHealth;
use crate::load_balancer::{
    peer::{duration_ms, Peer},
    LeastConnections, LoadBalancer, PeerId, RoundRobin, Tried,
};

/// Every peer is excluded, down, failed or saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no live upstreams")]
pub struct Busy;

/// Ordered collection of peers plus the aggregates used by selection.
#[derive(Debug)]
pub struct PeerSet {
    upstream: String,
    backup: bool,
    epoch: Instant,
    peers: RwLock<Vec<Peer>>,
    total_weight: i64,
    single: bool,
    weighted: bool,
    balancer: Box<dyn LoadBalancer>,
}

impl PeerSet {
    /// Create a set. Membership never changes afterwards.
    pub fn new(upstream: impl Into<String>, peers: Vec<Peer>, backup: bool, balance: BalanceMethod) -> Self {
        let total_weight = peers.iter().map(|p| p.weight).sum();
        let single = peers.len() == 1;
        let weighted = peers.windows(2).any(|w| w[0].weight != w[1].weight);
        let balancer: Box<dyn LoadBalancer> = match balance {
            BalanceMethod::RoundRobin => Box::new(RoundRobin::new()),
            BalanceMethod::LeastConn => Box::new(LeastConnections::new()),
        };

        Self {
            upstream: upstream.into(),
            backup,
            epoch: Instant::now(),
            peers: RwLock::new(peers),
            total_weight,
            single,
            weighted,
            balancer,
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn is_backup(&self) -> bool {
        self.backup
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    /// False when every peer has the same weight.
    pub fn is_weighted(&self) -> bool {
        self.weighted
    }

    pub fn total_weight(&self) -> i64 {
        self.total_weight
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn peer_id(&self, index: usize) -> PeerId {
        PeerId {
            backup: self.backup,
            index,
        }
    }

    /// Shared access to the peers; selection and status reads.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Peer>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the peers; outcome reporting.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<Peer>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now_ms(&self, now: Instant) -> u64 {
        duration_ms(now.saturating_duration_since(self.epoch))
    }

    /// Select a peer not in `tried`.
    pub fn select(self: &Arc<Self>, tried: &Tried, now: Instant) -> Option<SelectedPeer> {
        let peers = self.read();
        let now_ms = self.now_ms(now);
        let index = self.balancer.pick(self, &peers, tried, now_ms)?;

        let peer = &peers[index];
        peer.touch_checked(now_ms);
        peer.conns.fetch_add(1, Ordering::Relaxed);

        Some(SelectedPeer {
            id: self.peer_id(index),
            name: peer.name.clone(),
            addr: peer.addr,
            set: Arc::clone(self),
        })
    }

    /// Point-in-time view of every peer.
    pub fn snapshot(&self, now: Instant) -> Vec<PeerSnapshot> {
        let now_ms = self.now_ms(now);
        self.read()
            .iter()
            .map(|peer| PeerSnapshot {
                name: peer.name.clone(),
                addr: peer.addr,
                backup: self.backup,
                weight: peer.weight,
                effective_weight: peer.effective_weight(),
                current_weight: peer.current_weight(),
                fails: peer.fails,
                conns: peer.conns(),
                max_conns: peer.max_conns,
                health: PeerHealth::of(peer, now_ms, now),
            })
            .collect()
    }
}

/// The peers of one upstream: primary set plus optional backup set.
#[derive(Debug, Clone)]
pub struct UpstreamPeers {
    pub primary: Arc<PeerSet>,
    pub backup: Option<Arc<PeerSet>>,
}

impl UpstreamPeers {
    pub fn new(primary: PeerSet, backup: Option<PeerSet>) -> Self {
        Self {
            primary: Arc::new(primary),
            backup: backup.filter(|b| !b.is_empty()).map(Arc::new),
        }
    }

    /// Select from the primary set, falling back to the backup set.
    pub fn select(&self, tried: &Tried, now: Instant) -> Result<SelectedPeer, Busy> {
        if let Some(peer) = self.primary.select(tried, now) {
            return Ok(peer);
        }
        if let Some(backup) = &self.backup {
            if let Some(peer) = backup.select(tried, now) {
                tracing::debug!(upstream = %backup.upstream(), peer = %peer.name(), "Using backup peer");
                return Ok(peer);
            }
        }
        tracing::debug!(upstream = %self.primary.upstream(), "No live upstreams");
        Err(Busy)
    }

    /// Number of peers across both sets.
    pub fn len(&self) -> usize {
        self.primary.len() + self.backup.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, now: Instant) -> Vec<PeerSnapshot> {
        let mut all = self.primary.snapshot(now);
        if let Some(backup) = &self.backup {
            all.extend(backup.snapshot(now));
        }
        all
    }
}

/// A peer chosen for one attempt.
///
/// Holds one unit of the peer's connection gauge until dropped.
#[derive(Debug)]
pub struct SelectedPeer {
    id: PeerId,
    name: String,
    addr: SocketAddr,
    set: Arc<PeerSet>,
}

impl SelectedPeer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set(&self) -> &Arc<PeerSet> {
        &self.set
    }

    /// Run `f` against the selected peer under the read lock.
    pub fn with_peer<R>(&self, f: impl FnOnce(&Peer) -> R) -> R {
        f(&self.set.read()[self.id.index])
    }
}

impl Drop for SelectedPeer {
    fn drop(&mut self) {
        self.with_peer(|peer| peer.conns.fetch_sub(1, Ordering::Relaxed));
    }
}

/// Status view of a peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub name: String,
    pub addr: SocketAddr,
    pub backup: bool,
    pub weight: i64,
    pub effective_weight: i64,
    pub current_weight: i64,
    pub fails: u32,
    pub conns: usize,
    pub max_conns: usize,
    pub health: PeerHealth,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ServerConfig;

    pub(crate) fn set_of(weights: &[u32], backup: bool) -> PeerSet {
        let peers = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let addr: SocketAddr = format!("127.0.0.1:{}", 9000 + i).parse().unwrap();
                Peer::new(addr.to_string(), addr, &ServerConfig::new(addr.to_string()).weight(*w))
            })
            .collect();
        PeerSet::new("web", peers, backup, BalanceMethod::RoundRobin)
    }

    #[test]
    fn aggregates() {
        let set = set_of(&[1, 1, 2], false);
        assert_eq!(set.total_weight(), 4);
        assert!(set.is_weighted());
        assert!(!set.is_single());

        let single = set_of(&[3], false);
        assert!(single.is_single());
        assert!(!single.is_weighted());
    }

    #[test]
    fn selected_peer_holds_connection_gauge() {
        let set = Arc::new(set_of(&[1], false));
        let selected = set.select(&Tried::new(), Instant::now()).unwrap();
        assert_eq!(set.read()[0].conns(), 1);
        drop(selected);
        assert_eq!(set.read()[0].conns(), 0);
    }

    #[test]
    fn backup_used_only_when_primary_busy() {
        let peers = UpstreamPeers::new(set_of(&[1], false), Some(set_of(&[1], true)));
        let now = Instant::now();

        let first = peers.select(&Tried::new(), now).unwrap();
        assert!(!first.id().backup);

        let mut tried = Tried::new();
        tried.insert(first.id());
        let second = peers.select(&tried, now).unwrap();
        assert!(second.id().backup);

        tried.insert(second.id());
        assert_eq!(peers.select(&tried, now).unwrap_err(), Busy);
        assert_eq!(peers.len(), 2);
    }
}
