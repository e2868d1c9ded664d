//! Retry policy.
//!
//! # Responsibilities
//! - Represent the configured "retry on" conditions as a compact mask
//! - Map backend status codes onto their retry condition
//! - Bound failover by attempt count and elapsed time
//!
//! # Design Decisions
//! - Conditions are bits; classification does a single `contains` test
//! - `tries = 0` resolves to one try per configured peer
//! - Non-idempotent requests are only retried when explicitly allowed

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use http::StatusCode;

use crate::config::{RetryCondition, RetryConfig};

/// Set of conditions under which a request moves on to the next peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RetryOn(u16);

impl RetryOn {
    pub const OFF: Self = Self(0);
    pub const ERROR: Self = Self(1 << 0);
    pub const TIMEOUT: Self = Self(1 << 1);
    pub const INVALID_HEADER: Self = Self(1 << 2);
    pub const HTTP_500: Self = Self(1 << 3);
    pub const HTTP_502: Self = Self(1 << 4);
    pub const HTTP_503: Self = Self(1 << 5);
    pub const HTTP_504: Self = Self(1 << 6);
    pub const HTTP_403: Self = Self(1 << 7);
    pub const HTTP_404: Self = Self(1 << 8);
    pub const HTTP_429: Self = Self(1 << 9);
    pub const NON_IDEMPOTENT: Self = Self(1 << 10);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::ERROR, "error"),
        (Self::TIMEOUT, "timeout"),
        (Self::INVALID_HEADER, "invalid_header"),
        (Self::HTTP_500, "http_500"),
        (Self::HTTP_502, "http_502"),
        (Self::HTTP_503, "http_503"),
        (Self::HTTP_504, "http_504"),
        (Self::HTTP_403, "http_403"),
        (Self::HTTP_404, "http_404"),
        (Self::HTTP_429, "http_429"),
        (Self::NON_IDEMPOTENT, "non_idempotent"),
    ];

    /// Build the mask from configured conditions.
    pub fn from_conditions(conditions: &[RetryCondition]) -> Self {
        conditions.iter().fold(Self::OFF, |mask, condition| {
            mask | match condition {
                RetryCondition::Error => Self::ERROR,
                RetryCondition::Timeout => Self::TIMEOUT,
                RetryCondition::InvalidHeader => Self::INVALID_HEADER,
                RetryCondition::Http500 => Self::HTTP_500,
                RetryCondition::Http502 => Self::HTTP_502,
                RetryCondition::Http503 => Self::HTTP_503,
                RetryCondition::Http504 => Self::HTTP_504,
                RetryCondition::Http403 => Self::HTTP_403,
                RetryCondition::Http404 => Self::HTTP_404,
                RetryCondition::Http429 => Self::HTTP_429,
                RetryCondition::NonIdempotent => Self::NON_IDEMPOTENT,
                RetryCondition::Off => Self::OFF,
            }
        })
    }

    /// The condition bit a backend status code belongs to, if any.
    pub fn for_status(status: StatusCode) -> Option<Self> {
        match status.as_u16() {
            500 => Some(Self::HTTP_500),
            502 => Some(Self::HTTP_502),
            503 => Some(Self::HTTP_503),
            504 => Some(Self::HTTP_504),
            403 => Some(Self::HTTP_403),
            404 => Some(Self::HTTP_404),
            429 => Some(Self::HTTP_429),
            _ => None,
        }
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_off(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RetryOn {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RetryOn {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_off() {
            return f.write_str("RetryOn(off)");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "RetryOn({})", names.join("|"))
    }
}

/// Failover limits of one upstream.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_on: RetryOn,
    /// Maximum number of attempts, already resolved against the peer count.
    pub tries: u32,
    /// Budget measured from the session start (None = unlimited).
    pub timeout: Option<Duration>,
    pub exclude_tried: bool,
}

impl RetryPolicy {
    /// Resolve the configured policy for an upstream with `peer_count` peers.
    pub fn from_config(config: &RetryConfig, peer_count: usize) -> Self {
        let tries = if config.tries == 0 {
            u32::try_from(peer_count.max(1)).unwrap_or(u32::MAX)
        } else {
            config.tries
        };
        Self {
            retry_on: RetryOn::from_conditions(&config.retry_on),
            tries,
            timeout: (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms)),
            exclude_tried: config.exclude_tried,
        }
    }

    /// Whether the time budget still allows another attempt.
    pub fn within_budget(&self, elapsed: Duration) -> bool {
        self.timeout.map_or(true, |budget| elapsed < budget)
    }
}
