//! Peer health states.
//!
//! # States
//! - Up: peer receives traffic
//! - Failing: some failures recorded, still below max_fails
//! - Unavailable: max_fails reached inside the current fail_timeout window
//! - Down: administratively disabled
//!
//! # State Transitions
//! ```text
//! Up → Failing: failure reported
//! Failing → Unavailable: fails >= max_fails
//! Unavailable → (probe) after fail_timeout; success resets to Up
//! ```
//!
//! # Design Decisions
//! - The state is derived from the peer counters, never stored
//! - A single probe per window is handed out once fail_timeout elapses

use serde::Serialize;
use tokio::time::Instant;

use crate::load_balancer::peer::{duration_ms, Peer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PeerHealth {
    Up,
    Failing { fails: u32 },
    Unavailable { retry_in_ms: u64 },
    Down,
}

impl PeerHealth {
    /// Derive the state of `peer` at `now` (`now_ms` on the set's clock).
    pub fn of(peer: &Peer, now_ms: u64, now: Instant) -> Self {
        if peer.down {
            return PeerHealth::Down;
        }
        if peer.is_failed(now_ms) {
            let since = peer
                .accessed
                .map_or(0, |at| duration_ms(now.saturating_duration_since(at)));
            let window = duration_ms(peer.fail_timeout);
            return PeerHealth::Unavailable {
                retry_in_ms: window.saturating_sub(since),
            };
        }
        if peer.fails > 0 {
            return PeerHealth::Failing { fails: peer.fails };
        }
        PeerHealth::Up
    }

    /// Whether selection may currently choose the peer.
    pub fn is_selectable(&self) -> bool {
        matches!(self, PeerHealth::Up | PeerHealth::Failing { .. })
    }
}
