//! Failover controller.
//!
//! # Responsibilities
//! - Run one attempt up to a recognized response header
//! - Classify every failure (the only place `UpstreamError` is classified)
//! - Decide between retrying on another peer and finalizing
//!
//! # Design Decisions
//! - `tries` counts every attempt, the first one included
//! - A stale keepalive connection (reused, failed before any response
//!   byte) does not consume a try
//! - Once a response byte reached the downstream the controller is no
//!   longer consulted

use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};

use http::StatusCode;
use tokio::time::Instant;

use crate::health::PeerOutcome;
use crate::load_balancer::{PeerId, SelectedPeer, Tried};
use crate::resilience::{PhaseTimer, RetryOn, RetryPolicy};
use crate::upstream::forwarder::{RequestForwarder, SendStatus};
use crate::upstream::header::{ResponseHead, ResponseHeaderReader};
use crate::upstream::report::{millis, AttemptRecord};
use crate::upstream::{Connection, Phase, Upstream, UpstreamError, UpstreamProtocol};

/// Status reported when the client went away first.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// What went wrong, reduced to what failover cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connect refused/reset/unreachable, TLS failure, I/O error, premature close.
    Error,
    Timeout,
    /// Malformed or oversized response header.
    InvalidHeader,
    /// The peer answered with a status listed in `retry_on`.
    Status(StatusCode),
    /// Downstream closed or failed.
    Client,
    /// Local exhaustion or internal failure.
    Resource,
    /// Every peer is down, failed or excluded.
    NoLive,
}

/// Error taxonomy used for logging and fatality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Connect,
    Protocol,
    Status,
    Client,
    Resource,
}

impl From<&UpstreamError> for FailureKind {
    fn from(error: &UpstreamError) -> Self {
        match error {
            UpstreamError::Connect { source, .. } if is_resource_exhaustion(source) => FailureKind::Resource,
            UpstreamError::Connect { .. }
            | UpstreamError::Tls { .. }
            | UpstreamError::Io { .. }
            | UpstreamError::PrematureClose { .. } => FailureKind::Error,
            UpstreamError::Timeout { .. } => FailureKind::Timeout,
            UpstreamError::InvalidHeader(_) | UpstreamError::HeaderTooLarge => FailureKind::InvalidHeader,
            UpstreamError::Downstream(_) | UpstreamError::Cancelled => FailureKind::Client,
            UpstreamError::NoLiveUpstreams => FailureKind::NoLive,
            UpstreamError::Storage(_) | UpstreamError::Request(_) => FailureKind::Resource,
        }
    }
}

#[cfg(target_os = "linux")]
mod errno {
    pub const ENOMEM: i32 = 12;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const ENOBUFS: i32 = 105;

    pub const RESOURCE: &[i32] = &[ENOMEM, ENFILE, EMFILE, ENOBUFS];
}

#[cfg(not(target_os = "linux"))]
mod errno {
    pub const RESOURCE: &[i32] = &[];
}

/// Descriptor, buffer, memory or local address exhaustion. Raw errno values
/// are only matched on Linux; elsewhere the error kind decides.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.raw_os_error().is_some_and(|code| errno::RESOURCE.contains(&code))
        || matches!(e.kind(), io::ErrorKind::AddrNotAvailable | io::ErrorKind::OutOfMemory)
}

impl FailureKind {
    pub fn class(self) -> FailureClass {
        match self {
            FailureKind::Error | FailureKind::Timeout | FailureKind::NoLive => FailureClass::Connect,
            FailureKind::InvalidHeader => FailureClass::Protocol,
            FailureKind::Status(_) => FailureClass::Status,
            FailureKind::Client => FailureClass::Client,
            FailureKind::Resource => FailureClass::Resource,
        }
    }

    /// The `retry_on` condition that allows moving on after this failure.
    pub fn retry_flag(self) -> Option<RetryOn> {
        match self {
            FailureKind::Error => Some(RetryOn::ERROR),
            FailureKind::Timeout => Some(RetryOn::TIMEOUT),
            FailureKind::InvalidHeader => Some(RetryOn::INVALID_HEADER),
            FailureKind::Status(status) => RetryOn::for_status(status),
            FailureKind::Client | FailureKind::Resource | FailureKind::NoLive => None,
        }
    }

    /// Status the session ends with when this failure is final.
    pub fn final_status(self) -> StatusCode {
        match self {
            FailureKind::Error | FailureKind::InvalidHeader | FailureKind::NoLive => StatusCode::BAD_GATEWAY,
            FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            FailureKind::Status(status) => status,
            FailureKind::Client => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            FailureKind::Resource => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// How the failure counts against the peer, if at all.
    pub fn peer_outcome(self) -> Option<PeerOutcome> {
        match self {
            FailureKind::Error | FailureKind::Timeout | FailureKind::InvalidHeader => Some(PeerOutcome::Failure),
            FailureKind::Status(status) => match status.as_u16() {
                403 | 404 | 429 => Some(PeerOutcome::Next),
                500 | 502 | 503 | 504 => Some(PeerOutcome::Failure),
                _ => Some(PeerOutcome::Success),
            },
            FailureKind::Client | FailureKind::Resource | FailureKind::NoLive => None,
        }
    }

    /// Label used in logs, metrics and the outcome log.
    pub fn label(self) -> String {
        match self {
            FailureKind::Error => "error".to_string(),
            FailureKind::Timeout => "timeout".to_string(),
            FailureKind::InvalidHeader => "invalid_header".to_string(),
            FailureKind::Status(status) => format!("http_{}", status.as_u16()),
            FailureKind::Client => "client_closed".to_string(),
            FailureKind::Resource => "resource".to_string(),
            FailureKind::NoLive => "no_live_upstreams".to_string(),
        }
    }
}

/// Decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Start over on another peer with the rewound request.
    Retry,
    /// End the session with this status.
    Finalize(StatusCode),
    /// The peer's response is not retryable; relay it unchanged.
    RelayAsIs,
}

/// Circumstances of the failed attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptFacts {
    /// At least one request byte was written to the peer.
    pub request_sent: bool,
    /// The failure came from a reused connection before any response byte.
    pub stale: bool,
}

/// Retry bookkeeping of one session.
#[derive(Debug)]
pub struct FailoverController {
    policy: RetryPolicy,
    tries_left: u32,
    started: Instant,
    tried: Tried,
    idempotent: bool,
    header_delivered: bool,
}

impl FailoverController {
    pub fn new(policy: RetryPolicy, idempotent: bool) -> Self {
        Self {
            tries_left: policy.tries.max(1),
            policy,
            started: Instant::now(),
            tried: Tried::new(),
            idempotent,
            header_delivered: false,
        }
    }

    pub fn tries_left(&self) -> u32 {
        self.tries_left
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn note_tried(&mut self, id: PeerId) {
        self.tried.insert(id);
    }

    /// Peers the next selection must skip.
    pub fn exclusion(&self) -> Tried {
        if self.policy.exclude_tried {
            self.tried.clone()
        } else {
            Tried::new()
        }
    }

    /// A response byte reached the downstream; no retry from now on.
    pub fn mark_header_delivered(&mut self) {
        self.header_delivered = true;
    }

    pub fn header_delivered(&self) -> bool {
        self.header_delivered
    }

    /// The single decision point for a failed attempt.
    pub fn decide(&mut self, kind: FailureKind, facts: AttemptFacts) -> Verdict {
        let relay_or = |status: StatusCode| match kind {
            FailureKind::Status(_) => Verdict::RelayAsIs,
            _ => Verdict::Finalize(status),
        };

        if self.header_delivered {
            return relay_or(kind.final_status());
        }
        if !facts.stale {
            self.tries_left = self.tries_left.saturating_sub(1);
        }

        let Some(mut needed) = kind.retry_flag() else {
            return relay_or(kind.final_status());
        };
        if facts.request_sent && !self.idempotent {
            needed |= RetryOn::NON_IDEMPOTENT;
        }

        let elapsed = self.started.elapsed();
        let allowed = self.tries_left > 0
            && self.policy.retry_on.contains(needed)
            && self.policy.within_budget(elapsed);

        tracing::debug!(
            failure = %kind.label(),
            tries_left = self.tries_left,
            elapsed_ms = millis(elapsed),
            stale = facts.stale,
            allowed,
            "Failover decision"
        );

        if allowed {
            Verdict::Retry
        } else {
            relay_or(kind.final_status())
        }
    }
}

/// A header was received on `conn`.
#[derive(Debug)]
pub(crate) struct Established {
    pub conn: Connection,
    pub head: ResponseHead,
    /// The whole request reached the peer before the header was complete.
    pub request_complete: bool,
}

#[derive(Debug)]
pub(crate) struct AttemptFailure {
    pub error: UpstreamError,
    pub facts: AttemptFacts,
}

impl AttemptFailure {
    fn before_send(error: UpstreamError) -> Self {
        Self {
            error,
            facts: AttemptFacts::default(),
        }
    }
}

/// Connect (or reuse), then send the request and read the header.
///
/// Send and header read are interleaved: a peer may answer before the
/// request is complete.
pub(crate) async fn run_attempt<P>(
    upstream: &Upstream,
    peer: &SelectedPeer,
    forwarder: &mut RequestForwarder,
    protocol: &mut P,
    record: &mut AttemptRecord,
) -> Result<Established, AttemptFailure>
where
    P: UpstreamProtocol + ?Sized,
{
    let started = Instant::now();
    let mut conn = match upstream.pool.acquire(peer.addr()) {
        Some(conn) => {
            tracing::debug!(peer = %peer.name(), connection_id = %conn.id(), "Reusing keepalive connection");
            conn
        }
        None => {
            tracing::debug!(peer = %peer.name(), addr = %peer.addr(), "Connecting to upstream");
            match tokio::time::timeout(upstream.timeouts.connect, upstream.connector.connect(peer)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(error)) => return Err(AttemptFailure::before_send(error)),
                Err(_) => {
                    return Err(AttemptFailure::before_send(UpstreamError::Timeout {
                        phase: Phase::Connecting,
                    }))
                }
            }
        }
    };
    record.reused = conn.is_reused();
    record.connect_ms = millis(started.elapsed());
    conn.start_request();

    let timeouts = upstream.timeouts;
    let mut reader = ResponseHeaderReader::new(upstream.header_buffer_size);
    let mut timer = PhaseTimer::new(timeouts.send);
    let mut sending = true;

    let result = poll_fn(|cx| {
        exchange(cx, &mut conn, forwarder, &mut reader, protocol, &mut timer, &mut sending, timeouts.read)
    })
    .await;

    record.bytes_sent = forwarder.sent() as u64;
    record.bytes_received = reader.received() as u64;

    match result {
        Ok(head) => {
            record.header_ms = Some(millis(started.elapsed()));
            record.status = Some(head.parsed.status.as_u16());
            Ok(Established {
                conn,
                head,
                request_complete: forwarder.is_complete(),
            })
        }
        Err(error) => {
            let stale =
                conn.is_reused() && reader.received() == 0 && FailureKind::from(&error) == FailureKind::Error;
            Err(AttemptFailure {
                error,
                facts: AttemptFacts {
                    request_sent: forwarder.sent() > 0,
                    stale,
                },
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn exchange<P>(
    cx: &mut Context<'_>,
    conn: &mut Connection,
    forwarder: &mut RequestForwarder,
    reader: &mut ResponseHeaderReader,
    protocol: &mut P,
    timer: &mut PhaseTimer,
    sending: &mut bool,
    read_timeout: std::time::Duration,
) -> Poll<Result<ResponseHead, UpstreamError>>
where
    P: UpstreamProtocol + ?Sized,
{
    loop {
        let mut progress = false;

        if *sending {
            let before = forwarder.sent();
            match forwarder.send(cx, conn) {
                Ok(SendStatus::Complete) => {
                    *sending = false;
                    timer.restart(read_timeout);
                    progress = true;
                }
                Ok(SendStatus::Partial { .. }) => {
                    if forwarder.sent() > before {
                        timer.reset();
                        progress = true;
                    }
                }
                Err(e) => return Poll::Ready(Err(UpstreamError::io(Phase::Sending, e))),
            }
        }

        let received = reader.received();
        match reader.poll_read(cx, conn, &mut |buf| protocol.process_header(buf)) {
            Poll::Ready(result) => return Poll::Ready(result),
            Poll::Pending => {
                if reader.received() > received {
                    timer.reset();
                    progress = true;
                }
            }
        }

        if progress {
            continue;
        }
        if timer.poll_expired(cx).is_ready() {
            let phase = if *sending { Phase::Sending } else { Phase::ReadingHeader };
            return Poll::Ready(Err(UpstreamError::Timeout { phase }));
        }
        return Poll::Pending;
    }
}
