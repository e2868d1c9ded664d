//! Smooth weighted round-robin load balancing strategy.
//!
//! Every pick adds each candidate's effective weight to its current weight,
//! chooses the candidate with the highest current weight and subtracts the
//! sum of effective weights from the winner. Over `total_weight` picks each
//! peer is chosen `weight` times, interleaved rather than in bursts.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::load_balancer::{peer::Peer, LoadBalancer, PeerSet, Tried};

/// Round-robin selector.
/// Sets with equal weights rotate an internal counter instead, unless a
/// peer is throttled below its configured weight.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick_unweighted(&self, set: &PeerSet, peers: &[Peer], tried: &Tried, now_ms: u64) -> Option<usize> {
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = peers.len();

        (0..len)
            .map(|i| (start + i) % len)
            .find(|&index| !tried.contains(set.peer_id(index)) && peers[index].is_available(now_ms))
    }
}

/// Smooth weighted pick among candidates accepted by `eligible`.
pub(crate) fn pick_smooth(
    peers: &[Peer],
    mut eligible: impl FnMut(usize, &Peer) -> bool,
) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    let mut total = 0i64;

    for (index, peer) in peers.iter().enumerate() {
        if !eligible(index, peer) {
            continue;
        }

        let effective = peer.effective_weight.load(Ordering::Relaxed);
        let current = peer.current_weight.fetch_add(effective, Ordering::Relaxed) + effective;
        total += effective;

        if effective < peer.weight {
            peer.effective_weight.fetch_add(1, Ordering::Relaxed);
        }

        if best.map_or(true, |(_, best_current)| current > best_current) {
            best = Some((index, current));
        }
    }

    let (index, _) = best?;
    peers[index].current_weight.fetch_sub(total, Ordering::Relaxed);
    Some(index)
}

impl LoadBalancer for RoundRobin {
    fn pick(&self, set: &PeerSet, peers: &[Peer], tried: &Tried, now_ms: u64) -> Option<usize> {
        if peers.is_empty() {
            return None;
        }

        if set.is_single() {
            let available = !tried.contains(set.peer_id(0)) && peers[0].is_available(now_ms);
            return available.then_some(0);
        }

        let throttled = peers.iter().any(|p| p.effective_weight() < p.weight);
        if !set.is_weighted() && !throttled {
            return self.pick_unweighted(set, peers, tried, now_ms);
        }

        pick_smooth(peers, |index, peer| {
            !tried.contains(set.peer_id(index)) && peer.is_available(now_ms)
        })
    }
}
