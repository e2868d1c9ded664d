//! Upstream session.
//!
//! # Data Flow
//! ```text
//! start: protocol.create_request → RequestForwarder (chain kept for retries)
//! drive:
//!     loop {
//!         select peer (Busy → 502)
//!         run_attempt: connect/reuse → send ┐ → header
//!                                           ┘ interleaved
//!         failure or retryable status → FailoverController::decide
//!         header → BodyRelay to downstream (inactivity timer)
//!         release connection: pool when reusable, else close
//!     }
//!     → SessionReport
//! ```
//!
//! # Design Decisions
//! - One future per session; the connection, relay buffers and spill file
//!   are owned by it and dropped exactly once on every exit path
//! - Cancellation is a watch flag raced against the current operation
//! - A response captured for storage keeps relaying into a sink after the
//!   client leaves

use std::future::poll_fn;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use http::StatusCode;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::health::PeerOutcome;
use crate::load_balancer::SelectedPeer;
use crate::observability::metrics;
use crate::resilience::{PhaseTimer, RetryOn};
use crate::upstream::failover::{run_attempt, AttemptFacts, AttemptFailure, Established};
use crate::upstream::forwarder::RequestForwarder;
use crate::upstream::relay::{BodyRelay, RelayOutcome};
use crate::upstream::report::millis;
use crate::upstream::{
    AttemptRecord, Connection, FailoverController, FailureClass, FailureKind, Phase, RelayMode, SessionReport,
    Upstream, UpstreamError, UpstreamProtocol, Verdict,
};

/// Cancels a running session; the session finalizes as client-closed.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One request passed to an upstream, retries included.
#[derive(Debug)]
pub struct UpstreamSession<P> {
    id: Uuid,
    upstream: Arc<Upstream>,
    protocol: P,
    forwarder: RequestForwarder,
    cancel: watch::Receiver<bool>,
}

impl<P: UpstreamProtocol> UpstreamSession<P> {
    /// Build the request. No I/O happens until `drive`.
    pub fn start(upstream: Arc<Upstream>, mut protocol: P) -> Result<(Self, CancelHandle), UpstreamError> {
        let chain = protocol.create_request(upstream.pool.is_enabled())?;
        let forwarder = RequestForwarder::new(chain, protocol.request_body());
        let (tx, rx) = watch::channel(false);

        let session = Self {
            id: Uuid::new_v4(),
            upstream,
            protocol,
            forwarder,
            cancel: rx,
        };
        Ok((session, CancelHandle { tx }))
    }

    /// Use the request's own id instead of a fresh one.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the session to completion, writing the response to `downstream`.
    pub async fn drive<D>(self, downstream: &mut D) -> SessionReport
    where
        D: AsyncWrite + Unpin + ?Sized,
    {
        let span = tracing::info_span!("upstream", session = %self.id, upstream = %self.upstream.name);
        self.run(downstream).instrument(span).await
    }

    async fn run<D>(self, downstream: &mut D) -> SessionReport
    where
        D: AsyncWrite + Unpin + ?Sized,
    {
        let UpstreamSession {
            id,
            upstream,
            mut protocol,
            mut forwarder,
            mut cancel,
        } = self;

        let started = Instant::now();
        let store = protocol.store_response();
        let mut report = SessionReport::new(id, &upstream.name);
        let mut failover = FailoverController::new(upstream.retry.clone(), protocol.is_idempotent());
        let mut stored_without_client = false;

        let status = loop {
            let peer = match upstream.peers.select(&failover.exclusion(), Instant::now()) {
                Ok(peer) => peer,
                Err(busy) => {
                    tracing::error!(error = %UpstreamError::from(busy), attempts = report.attempts.len(), "No live upstreams");
                    break FailureKind::NoLive.final_status();
                }
            };
            failover.note_tried(peer.id());
            if !report.attempts.is_empty() {
                protocol.reinit_request();
                forwarder.rewind();
            }

            let mut record = AttemptRecord::new(&peer);
            let attempt_started = Instant::now();

            let result = {
                let attempt = run_attempt(&upstream, &peer, &mut forwarder, &mut protocol, &mut record);
                if store {
                    attempt.await
                } else {
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => Err(AttemptFailure {
                            error: UpstreamError::Cancelled,
                            facts: AttemptFacts::default(),
                        }),
                        result = attempt => result,
                    }
                }
            };

            let Established {
                conn,
                head,
                request_complete,
            } = match result {
                Ok(established) => established,
                Err(AttemptFailure { error, facts }) => {
                    record.total_ms = millis(attempt_started.elapsed());
                    if matches!(error, UpstreamError::Cancelled) {
                        report.cancelled = true;
                    }
                    match on_failure(&upstream, &peer, &mut failover, &mut report, record, &error, facts) {
                        ControlFlow::Continue(()) => continue,
                        ControlFlow::Break(status) => break status,
                    }
                }
            };

            let status = head.parsed.status;
            if RetryOn::for_status(status).is_some() {
                let kind = FailureKind::Status(status);
                let facts = AttemptFacts {
                    request_sent: true,
                    stale: false,
                };
                if failover.decide(kind, facts) == Verdict::Retry {
                    tracing::info!(peer = %peer.name(), status = status.as_u16(), "Upstream returned retryable status, trying next upstream");
                    upstream.pool.release(conn, false);
                    record.failure = Some(kind.label());
                    record.total_ms = millis(attempt_started.elapsed());
                    if let Some(outcome) = kind.peer_outcome() {
                        peer.report(outcome);
                    }
                    metrics::record_attempt(&upstream.name, peer.name(), "next");
                    report.push(record);
                    continue;
                }
            }

            let mode = RelayMode::resolve(upstream.relay.buffering, head.parsed.buffering);
            record.relay_mode = Some(mode);
            tracing::debug!(peer = %peer.name(), status = status.as_u16(), ?mode, framing = ?head.parsed.framing, "Upstream response header received");

            let keep_alive = head.parsed.keep_alive;
            // already counted by the header reader
            let leftover_len = head.leftover.len() as u64;
            let mut relay = BodyRelay::new(mode, head.parsed.framing, &upstream.relay);
            let mut conn = conn;
            let mut detached_at = None;
            let outcome = match relay
                .push_header(head.raw)
                .and_then(|()| relay.ingest(head.leftover, &mut |chunk| protocol.input_filter(chunk)))
            {
                Ok(()) => {
                    relay_body(
                        &mut relay,
                        &mut conn,
                        downstream,
                        &mut protocol,
                        &mut cancel,
                        upstream.timeouts.read,
                        store,
                        &mut detached_at,
                    )
                    .await
                }
                Err(error) => Err(error),
            };

            let stats = relay.stats();
            record.bytes_received += stats.upstream_bytes.saturating_sub(leftover_len);
            record.peak_memory = Some(stats.peak_memory);
            record.spilled = stats.spilled;
            record.total_ms = millis(attempt_started.elapsed());
            // bytes drained into the sink after the client left were never delivered
            let delivered = detached_at.unwrap_or(stats.downstream_bytes);
            if detached_at.is_some() {
                report.cancelled = true;
            }
            report.bytes_downstream += delivered;
            if delivered > 0 {
                failover.mark_header_delivered();
                report.header_delivered = true;
            }

            match outcome {
                Ok(RelayOutcome { reusable }) => {
                    stored_without_client = detached_at.is_some();
                    let reusable = reusable && keep_alive && request_complete;
                    upstream.pool.release(conn, reusable);
                    peer.report(PeerOutcome::Success);
                    metrics::record_attempt(&upstream.name, peer.name(), "success");
                    tracing::debug!(
                        upstream_bytes = stats.upstream_bytes,
                        downstream_bytes = stats.downstream_bytes,
                        spilled = stats.spilled,
                        peak_memory = stats.peak_memory,
                        reusable,
                        "Upstream response relayed"
                    );
                    report.push(record);
                    break status;
                }
                Err(error) if failover.header_delivered() => {
                    drop(conn);
                    let kind = FailureKind::from(&error);
                    if matches!(error, UpstreamError::Cancelled | UpstreamError::Downstream(_)) {
                        report.cancelled = true;
                        tracing::info!(error = %error, "Client closed connection while relaying response");
                    } else {
                        tracing::error!(error = %error, peer = %peer.name(), "Upstream response truncated");
                    }
                    if let Some(outcome) = kind.peer_outcome() {
                        peer.report(outcome);
                    }
                    report.truncated = true;
                    record.failure = Some(kind.label());
                    metrics::record_attempt(&upstream.name, peer.name(), "failure");
                    report.push(record);
                    break status;
                }
                Err(error) => {
                    drop(conn);
                    if matches!(error, UpstreamError::Cancelled | UpstreamError::Downstream(_)) {
                        report.cancelled = true;
                    }
                    let facts = AttemptFacts {
                        request_sent: true,
                        stale: false,
                    };
                    match on_failure(&upstream, &peer, &mut failover, &mut report, record, &error, facts) {
                        ControlFlow::Continue(()) => continue,
                        ControlFlow::Break(status) => break status,
                    }
                }
            }
        };

        if report.cancelled && !stored_without_client {
            protocol.abort_request();
        }
        protocol.finalize_request(status);

        let elapsed = started.elapsed();
        report.finish(status.as_u16(), elapsed);
        metrics::record_session(&upstream.name, report.status, elapsed);
        tracing::info!(
            status = report.status,
            attempts = report.attempts.len(),
            elapsed_ms = report.elapsed_ms,
            header_delivered = report.header_delivered,
            truncated = report.truncated,
            cancelled = report.cancelled,
            "Upstream session finished"
        );
        report
    }
}

/// Account a failed attempt and ask the controller what comes next.
fn on_failure(
    upstream: &Upstream,
    peer: &SelectedPeer,
    failover: &mut FailoverController,
    report: &mut SessionReport,
    mut record: AttemptRecord,
    error: &UpstreamError,
    facts: AttemptFacts,
) -> ControlFlow<StatusCode> {
    let kind = FailureKind::from(error);
    match kind.class() {
        FailureClass::Connect | FailureClass::Resource => {
            tracing::error!(error = %error, peer = %peer.name(), addr = %peer.addr(), stale = facts.stale, "Upstream attempt failed")
        }
        FailureClass::Protocol => tracing::warn!(error = %error, peer = %peer.name(), "Upstream sent invalid response"),
        FailureClass::Client => tracing::info!(error = %error, "Client closed connection"),
        FailureClass::Status => {}
    }

    if facts.stale {
        tracing::debug!(peer = %peer.name(), "Cached connection was closed by the peer");
    } else if let Some(outcome) = kind.peer_outcome() {
        peer.report(outcome);
    }
    record.failure = Some(kind.label());
    metrics::record_attempt(&upstream.name, peer.name(), "failure");
    report.push(record);

    match failover.decide(kind, facts) {
        Verdict::Retry => {
            tracing::info!(failure = %kind.label(), tries_left = failover.tries_left(), "Trying next upstream");
            ControlFlow::Continue(())
        }
        Verdict::Finalize(status) => ControlFlow::Break(status),
        Verdict::RelayAsIs => ControlFlow::Break(kind.final_status()),
    }
}

/// Relay the body, honoring cancellation. A response captured for storage
/// continues into a sink once the client is gone; `detached_at` then holds
/// the downstream byte count at that moment.
#[allow(clippy::too_many_arguments)]
async fn relay_body<P, D>(
    relay: &mut BodyRelay,
    conn: &mut Connection,
    downstream: &mut D,
    protocol: &mut P,
    cancel: &mut watch::Receiver<bool>,
    read_timeout: Duration,
    store: bool,
    detached_at: &mut Option<u64>,
) -> Result<RelayOutcome, UpstreamError>
where
    P: UpstreamProtocol + ?Sized,
    D: AsyncWrite + Unpin + ?Sized,
{
    let mut sink = tokio::io::sink();
    loop {
        let result = if detached_at.is_some() {
            pump(relay, conn, &mut sink, protocol, read_timeout).await
        } else {
            tokio::select! {
                biased;
                _ = cancelled(cancel) => Err(UpstreamError::Cancelled),
                result = pump(relay, conn, downstream, protocol, read_timeout) => result,
            }
        };

        match result {
            Err(UpstreamError::Cancelled | UpstreamError::Downstream(_)) if store && detached_at.is_none() => {
                tracing::info!("Client gone, finishing response for storage");
                *detached_at = Some(relay.stats().downstream_bytes);
            }
            other => return other,
        }
    }
}

/// Drive the relay under the inactivity timer.
async fn pump<P, W>(
    relay: &mut BodyRelay,
    conn: &mut Connection,
    downstream: &mut W,
    protocol: &mut P,
    read_timeout: Duration,
) -> Result<RelayOutcome, UpstreamError>
where
    P: UpstreamProtocol + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut timer = PhaseTimer::new(read_timeout);
    poll_fn(|cx| {
        let before = relay.stats();
        if let Poll::Ready(result) = relay.poll_relay(cx, conn, downstream, &mut |chunk| protocol.input_filter(chunk)) {
            return Poll::Ready(result);
        }
        let after = relay.stats();
        if after.upstream_bytes != before.upstream_bytes || after.downstream_bytes != before.downstream_bytes {
            timer.reset();
        }
        if timer.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(UpstreamError::Timeout {
                phase: Phase::RelayingBody,
            }));
        }
        Poll::Pending
    })
    .await
}

/// Resolves once the flag is raised; never if the handle is dropped unused.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let raised = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
    if raised.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryCondition;
    use crate::http::upstream::Http1Protocol;
    use crate::load_balancer::peer_set::tests::set_of;
    use crate::load_balancer::UpstreamPeers;
    use crate::upstream::Connect;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::Context;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Debug, Clone)]
    enum Behavior {
        Refuse,
        Hang,
        Respond(&'static [u8]),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Connect,
        Delivered,
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    #[derive(Debug)]
    struct MockConnector {
        script: Mutex<VecDeque<Behavior>>,
        events: Events,
    }

    impl MockConnector {
        fn new(script: impl IntoIterator<Item = Behavior>, events: Events) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                events,
            }
        }
    }

    #[async_trait]
    impl Connect for MockConnector {
        async fn connect(&self, peer: &SelectedPeer) -> Result<Connection, UpstreamError> {
            self.events.lock().unwrap().push(Event::Connect);
            let behavior = self.script.lock().unwrap().pop_front().unwrap_or(Behavior::Refuse);
            match behavior {
                Behavior::Refuse => Err(UpstreamError::Connect {
                    addr: peer.addr(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                }),
                Behavior::Hang => std::future::pending().await,
                Behavior::Respond(response) => {
                    let (near, far) = tokio::io::duplex(64 * 1024);
                    tokio::spawn(serve(far, response));
                    Ok(Connection::new(peer.addr(), near))
                }
            }
        }
    }

    /// Read one request head, answer, close.
    async fn serve(mut far: DuplexStream, response: &'static [u8]) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            match far.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
        let _ = far.write_all(response).await;
    }

    /// Downstream that records when the first byte arrives.
    struct Recorder {
        bytes: Vec<u8>,
        events: Events,
    }

    impl AsyncWrite for Recorder {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.bytes.is_empty() && !buf.is_empty() {
                self.events.lock().unwrap().push(Event::Delivered);
            }
            self.bytes.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
    const UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";
    const GARBAGE: &[u8] = b"SSH-2.0-OpenSSH\r\n\r\n";
    const TRUNCATED: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort";

    fn upstream(weights: &[u32], script: Vec<Behavior>, retry_on: &[RetryCondition], events: Events) -> Upstream {
        let peers = UpstreamPeers::new(set_of(weights, false), None);
        let mut upstream = Upstream::new("web", peers, Arc::new(MockConnector::new(script, events)));
        upstream.retry.retry_on = RetryOn::from_conditions(retry_on);
        upstream
    }

    fn get() -> Http1Protocol {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "backend.test".parse().unwrap());
        Http1Protocol::new(Method::GET, "/".parse().unwrap(), headers, Bytes::new())
    }

    async fn drive(upstream: Upstream) -> (SessionReport, Vec<u8>) {
        let (session, _cancel) = UpstreamSession::start(Arc::new(upstream), get()).unwrap();
        let mut out = Vec::new();
        let report = session.drive(&mut out).await;
        (report, out)
    }

    const DEFAULT_RETRY: &[RetryCondition] = &[RetryCondition::Error, RetryCondition::Timeout];

    #[tokio::test]
    async fn relays_response_byte_exact() {
        let events = Events::default();
        let (report, out) = drive(upstream(&[1], vec![Behavior::Respond(OK)], DEFAULT_RETRY, events)).await;

        assert_eq!(report.status, 200);
        assert_eq!(report.attempts.len(), 1);
        assert!(report.is_complete());
        assert_eq!(out, OK);
        assert_eq!(report.bytes_downstream, OK.len() as u64);
    }

    #[tokio::test]
    async fn refused_peer_is_retried_and_marked() {
        let events = Events::default();
        let upstream = upstream(&[1, 1], vec![Behavior::Refuse, Behavior::Respond(OK)], DEFAULT_RETRY, events);
        let primary = Arc::clone(&upstream.peers.primary);
        let (report, out) = drive(upstream).await;

        assert_eq!(report.status, 200);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[0].failure.as_deref(), Some("error"));
        assert!(report.attempts[1].succeeded());
        assert_eq!(out, OK);
        assert_eq!(primary.read()[0].fails(), 1);
    }

    #[tokio::test]
    async fn status_outside_retry_on_is_relayed() {
        let events = Events::default();
        let (report, out) = drive(upstream(&[1], vec![Behavior::Respond(BAD_GATEWAY)], DEFAULT_RETRY, events)).await;

        assert_eq!(report.status, 502);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(out, BAD_GATEWAY);
    }

    #[tokio::test]
    async fn retryable_status_moves_to_next_peer() {
        let events = Events::default();
        let retry_on = [RetryCondition::Error, RetryCondition::Http503];
        let script = vec![Behavior::Respond(UNAVAILABLE), Behavior::Respond(OK)];
        let (report, out) = drive(upstream(&[1, 1], script, &retry_on, events)).await;

        assert_eq!(report.status, 200);
        assert_eq!(report.attempts[0].status, Some(503));
        assert_eq!(report.attempts[0].failure.as_deref(), Some("http_503"));
        assert_eq!(out, OK);
    }

    #[tokio::test]
    async fn exhausted_status_retry_relays_last_response() {
        let events = Events::default();
        let retry_on = [RetryCondition::Http503];
        let script = vec![Behavior::Respond(UNAVAILABLE), Behavior::Respond(UNAVAILABLE)];
        let (report, out) = drive(upstream(&[1, 1], script, &retry_on, events)).await;

        assert_eq!(report.status, 503);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(out, UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_maps_to_504() {
        let events = Events::default();
        let mut upstream = upstream(&[1], vec![Behavior::Hang], DEFAULT_RETRY, events);
        upstream.timeouts.connect = Duration::from_millis(100);
        let (report, out) = drive(upstream).await;

        assert_eq!(report.status, 504);
        assert_eq!(report.attempts[0].failure.as_deref(), Some("timeout"));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn no_live_upstreams_without_io() {
        let events = Events::default();
        let upstream = upstream(&[1, 1], vec![Behavior::Respond(OK)], DEFAULT_RETRY, Arc::clone(&events));
        for peer in upstream.peers.primary.write().iter_mut() {
            peer.down = true;
        }
        let (report, _) = drive(upstream).await;

        assert_eq!(report.status, 502);
        assert!(report.attempts.is_empty());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_header_fails_over() {
        let events = Events::default();
        let retry_on = [RetryCondition::Error, RetryCondition::InvalidHeader];
        let script = vec![Behavior::Respond(GARBAGE), Behavior::Respond(OK)];
        let (report, out) = drive(upstream(&[1, 1], script, &retry_on, events)).await;

        assert_eq!(report.attempts[0].failure.as_deref(), Some("invalid_header"));
        assert_eq!(report.status, 200);
        assert_eq!(out, OK);
    }

    #[tokio::test]
    async fn cancel_before_header_finalizes_499() {
        let events = Events::default();
        let upstream = upstream(&[1], vec![Behavior::Hang], DEFAULT_RETRY, events);
        let (session, cancel) = UpstreamSession::start(Arc::new(upstream), get()).unwrap();

        let task = tokio::spawn(async move {
            let mut out = Vec::new();
            session.drive(&mut out).await
        });
        tokio::task::yield_now().await;
        cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.status, 499);
        assert!(report.cancelled);
        assert!(!report.header_delivered);
    }

    /// Downstream whose every write fails.
    struct Gone;

    impl AsyncWrite for Gone {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn stored_response_outlives_the_client() {
        let events = Events::default();
        let stored = Arc::new(upstream(&[1], vec![Behavior::Respond(OK)], DEFAULT_RETRY, events));
        let (session, _cancel) = UpstreamSession::start(stored, get().with_store(true)).unwrap();
        let report = session.drive(&mut Gone).await;

        assert_eq!(report.status, 200);
        assert!(report.attempts[0].succeeded());
        assert_eq!(report.bytes_downstream, 0);
        assert!(report.cancelled);
        assert!(!report.header_delivered);

        let events = Events::default();
        let plain = Arc::new(upstream(&[1], vec![Behavior::Respond(OK)], DEFAULT_RETRY, events));
        let (session, _cancel) = UpstreamSession::start(plain, get()).unwrap();
        let report = session.drive(&mut Gone).await;

        assert_eq!(report.status, 499);
        assert!(report.cancelled);
    }

    #[tokio::test]
    async fn no_retry_after_delivery() {
        for _ in 0..100 {
            let events = Events::default();
            let script: Vec<Behavior> = (0..6)
                .map(|_| match fastrand::u8(0..5) {
                    0 => Behavior::Refuse,
                    1 => Behavior::Respond(GARBAGE),
                    2 => Behavior::Respond(BAD_GATEWAY),
                    3 => Behavior::Respond(TRUNCATED),
                    _ => Behavior::Respond(OK),
                })
                .collect();
            let retry_on = [
                RetryCondition::Error,
                RetryCondition::Timeout,
                RetryCondition::InvalidHeader,
                RetryCondition::Http502,
            ];
            let mut upstream = upstream(&[1, 1, 1], script, &retry_on, Arc::clone(&events));
            upstream.retry.tries = 6;

            let (session, _cancel) = UpstreamSession::start(Arc::new(upstream), get()).unwrap();
            let mut downstream = Recorder {
                bytes: Vec::new(),
                events: Arc::clone(&events),
            };
            let report = session.drive(&mut downstream).await;

            let events = events.lock().unwrap().clone();
            let delivered_at = events.iter().position(|e| *e == Event::Delivered);
            if let Some(at) = delivered_at {
                let connects_after = events[at..].iter().filter(|e| **e == Event::Connect).count();
                assert_eq!(connects_after, 0, "connect after delivery: {events:?}");
                assert!(report.header_delivered);
            }
            if report.truncated {
                assert!(report.header_delivered);
            }
            let connects_before = events.iter().filter(|e| **e == Event::Connect).count();
            assert_eq!(connects_before, report.attempts.len());
        }
    }
}
