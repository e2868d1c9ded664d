//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe attempt outcomes reported by the failover controller
//! - Count failures inside the fail_timeout window
//! - Lower the effective weight of failing peers
//!
//! # Design Decisions
//! - Connect errors, timeouts, invalid headers and 5xx retry statuses are failures
//! - 403/404/429 move to the next peer without counting as a failure
//! - A success resets the failure count
//! - Client aborts are never reported against a peer

use std::sync::atomic::Ordering;

use tokio::time::Instant;

use crate::load_balancer::{PeerSet, SelectedPeer};
use crate::observability::metrics;

/// Result of one attempt as seen by peer accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Success,
    Failure,
    /// Moved on to another peer without blaming this one.
    Next,
}

impl PeerSet {
    /// Apply the outcome of an attempt against the peer at `index`.
    pub fn report_outcome(&self, index: usize, outcome: PeerOutcome, now: Instant) {
        let now_ms = self.now_ms(now);
        let mut peers = self.write();
        let Some(peer) = peers.get_mut(index) else {
            return;
        };

        match outcome {
            PeerOutcome::Failure => {
                peer.fails = peer.fails.saturating_add(1);
                peer.accessed = Some(now);
                peer.checked.store(now_ms, Ordering::Relaxed);

                if peer.max_fails > 0 {
                    let step = peer.weight / i64::from(peer.max_fails);
                    let effective = (peer.effective_weight() - step).max(0);
                    peer.effective_weight.store(effective, Ordering::Relaxed);

                    if peer.fails >= peer.max_fails {
                        tracing::warn!(
                            upstream = %self.upstream(),
                            peer = %peer.name,
                            addr = %peer.addr,
                            fails = peer.fails,
                            fail_timeout_ms = peer.fail_timeout.as_millis() as u64,
                            "Upstream server temporarily disabled"
                        );
                        metrics::set_peer_available(self.upstream(), &peer.name, false);
                    }
                }
            }
            PeerOutcome::Success => {
                if peer.fails > 0 {
                    tracing::info!(upstream = %self.upstream(), peer = %peer.name, "Upstream server recovered");
                    metrics::set_peer_available(self.upstream(), &peer.name, true);
                }
                peer.fails = 0;
            }
            PeerOutcome::Next => {}
        }
    }
}

impl SelectedPeer {
    pub fn report(&self, outcome: PeerOutcome) {
        self.set().report_outcome(self.id().index, outcome, Instant::now());
    }
}
