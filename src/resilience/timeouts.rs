//! Timeout enforcement.
//!
//! # Responsibilities
//! - Hold the per-phase timeouts of an upstream
//! - Provide a resettable timer polled alongside the phase's I/O
//!
//! # Design Decisions
//! - Connect is an absolute deadline
//! - Send, read-header and relay are inactivity timers, reset on progress
//! - Timeout errors are distinct from other errors and map to 504

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Instant, Sleep};

use crate::config::TimeoutConfig;
use crate::upstream::Phase;

/// Per-phase timeouts of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub read: Duration,
}

impl PhaseTimeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_ms),
            send: Duration::from_millis(config.send_ms),
            read: Duration::from_millis(config.read_ms),
        }
    }

    /// Timeout governing `phase`.
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Connecting => self.connect,
            Phase::Sending => self.send,
            Phase::ReadingHeader | Phase::RelayingBody => self.read,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Inactivity timer for one phase.
#[derive(Debug)]
pub struct PhaseTimer {
    sleep: Pin<Box<Sleep>>,
    period: Duration,
}

impl PhaseTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(period)),
            period,
        }
    }

    /// Push the deadline `period` into the future.
    pub fn reset(&mut self) {
        let deadline = Instant::now() + self.period;
        self.sleep.as_mut().reset(deadline);
    }

    /// Switch to another phase's period, restarting the countdown.
    pub fn restart(&mut self, period: Duration) {
        self.period = period;
        self.reset();
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ready once the deadline has passed; registers the waker otherwise.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}
