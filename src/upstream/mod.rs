//! Upstream proxying engine.
//!
//! # Data Flow
//! ```text
//! UpstreamSession::start (protocol builds the request chain)
//!     → session.rs drive loop
//!         → load_balancer (select peer, Busy → 502 without I/O)
//!         → failover.rs run_attempt:
//!             keepalive.rs acquire, else connector.rs connect (+ TLS)
//!             → forwarder.rs send chain  ┐ interleaved on one connection
//!             → header.rs read header    ┘
//!         → failover.rs decide (retry with rewound chain, or finalize)
//!         → relay/ buffered or streaming body relay to downstream
//!         → keepalive.rs release (cache healthy connection) or close
//!     → SessionReport
//! ```
//!
//! # Design Decisions
//! - Components are `poll_*` functions over tokio's AsyncRead/AsyncWrite;
//!   a Pending return registers readiness interest with the reactor
//! - One driver future per session, so one outstanding operation at a time
//! - At most one live upstream connection per session
//! - Failover is impossible once a response byte reached the downstream

pub mod chain;
pub mod connector;
pub mod error;
pub mod failover;
pub mod forwarder;
pub mod framing;
pub mod header;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod report;
pub mod session;
pub mod transport;

use std::fmt;

use serde::Serialize;

pub use chain::BufferChain;
pub use connector::{Connect, TcpConnector};
pub use error::UpstreamError;
pub use failover::{FailoverController, FailureClass, FailureKind, Verdict};
pub use keepalive::ConnectionPool;
pub use protocol::{HeaderParse, ParsedHeader, UpstreamProtocol};
pub use registry::{Upstream, UpstreamRegistry};
pub use relay::{RelayMode, RelayStats};
pub use report::{AttemptRecord, SessionReport};
pub use session::{CancelHandle, UpstreamSession};
pub use transport::{Connection, Transport};

/// Phase of one attempt against a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Sending,
    ReadingHeader,
    RelayingBody,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Connecting => "connecting to upstream",
            Phase::Sending => "sending request to upstream",
            Phase::ReadingHeader => "reading response header from upstream",
            Phase::RelayingBody => "reading upstream",
        };
        f.write_str(s)
    }
}
