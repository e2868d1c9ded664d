//! Passive health subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt finished (failover controller):
//!     → passive.rs (report_outcome: success, failure or next)
//!     → Update peer counters under the set's write lock
//!     → Derived state (state.rs) visible to selection and the admin API
//! ```
//!
//! # Design Decisions
//! - No active probing; health is learned from real traffic only
//! - A failed peer gets one probe request per fail_timeout window
//! - Health state is per-peer, not per-upstream

pub mod passive;
pub mod state;

pub use passive::PeerOutcome;
pub use state::PeerHealth;
