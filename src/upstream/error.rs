//! Engine error type.

use std::io;
use std::net::SocketAddr;

use crate::load_balancer::Busy;
use crate::upstream::Phase;

/// Every failure the engine can observe. Classified in one place,
/// `failover::FailureKind::from`.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect() to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("upstream timed out while {phase}")]
    Timeout { phase: Phase },

    #[error("I/O error while {phase}: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    #[error("upstream prematurely closed connection while {phase}")]
    PrematureClose { phase: Phase },

    #[error("upstream sent invalid header: {0}")]
    InvalidHeader(String),

    #[error("upstream sent too big header")]
    HeaderTooLarge,

    #[error("downstream connection failed: {0}")]
    Downstream(#[source] io::Error),

    #[error("no live upstreams")]
    NoLiveUpstreams,

    #[error("response storage failed: {0}")]
    Storage(#[source] io::Error),

    #[error("cannot build upstream request: {0}")]
    Request(String),

    #[error("session cancelled by client")]
    Cancelled,
}

impl UpstreamError {
    pub fn io(phase: Phase, source: io::Error) -> Self {
        UpstreamError::Io { phase, source }
    }
}

impl From<Busy> for UpstreamError {
    fn from(_: Busy) -> Self {
        UpstreamError::NoLiveUpstreams
    }
}
