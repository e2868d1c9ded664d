//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against a peer:
//!     → timeouts.rs (per-phase timer around connect/send/read)
//!     → On failure: failover controller consults retries.rs
//!         (condition enabled? tries left? time budget left?)
//!     → passive health accounting on the peer (health/passive.rs)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every phase has a deadline
//! - Retries are immediate and move to another peer, no backoff
//! - Non-idempotent requests are not retried once sent, unless allowed

pub mod retries;
pub mod timeouts;

pub use retries::{RetryOn, RetryPolicy};
pub use timeouts::{PhaseTimeouts, PhaseTimer};
