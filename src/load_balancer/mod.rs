//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Session needs a peer
//!     → peer_set.rs (UpstreamPeers: primary set, then backup set)
//!     → Apply load balancing algorithm under the set's read lock:
//!         - round_robin.rs (smooth weighted round-robin)
//!         - least_conn.rs (fewest connections per weight)
//!     → peer.rs (connection gauge held by a PeerGuard)
//!     → Return SelectedPeer or Busy (no live upstreams)
//!
//! Attempt finished
//!     → health/passive.rs (report_outcome under the write lock)
//! ```
//!
//! # Design Decisions
//! - Membership is immutable; a reload builds new sets
//! - Down, failed and saturated peers are skipped, never waited for
//! - Busy is returned without any network I/O
//! - No lock is held across an await point

pub mod least_conn;
pub mod peer;
pub mod peer_set;
pub mod round_robin;

use std::collections::HashSet;
use std::fmt;

pub use least_conn::LeastConnections;
pub use peer::Peer;
pub use peer_set::{Busy, PeerSet, PeerSnapshot, SelectedPeer, UpstreamPeers};
pub use round_robin::RoundRobin;

/// A peer selection algorithm.
///
/// `pick` runs under the set's read lock and may only mutate the atomic
/// weight fields of the peers.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Index of the peer to use, or None when every candidate is unavailable.
    fn pick(&self, set: &PeerSet, peers: &[Peer], tried: &Tried, now_ms: u64) -> Option<usize>;
}

/// Identifies a peer across the primary and backup sets of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub backup: bool,
    pub index: usize,
}

/// Peers a session has already attempted.
#[derive(Debug, Clone, Default)]
pub struct Tried {
    peers: HashSet<PeerId>,
}

impl Tried {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PeerId) {
        self.peers.insert(id);
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
