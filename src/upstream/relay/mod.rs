//! Response body relay.
//!
//! # Data Flow
//! ```text
//! upstream ──read ≤ buffer_size──▶ framing tracker ──▶ input filter ──▶ strategy
//!                                                                         │
//!   buffered.rs: memory queue, spill.rs temp file beyond the threshold    │
//!   streaming.rs: one buffer, refilled only after it was flushed          │
//!                                                                         ▼
//!                                                          downstream (in order)
//! ```
//!
//! # Design Decisions
//! - Header bytes go first and bypass the tracker and the filter
//! - Both loops run in one poll; each registers its own readiness interest
//! - End of body comes from length accounting or EOF; nothing is altered

pub mod buffered;
pub mod spill;
pub mod streaming;

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::BufferingConfig;
use crate::upstream::framing::{BodyFraming, FramingTracker};
use crate::upstream::{Phase, UpstreamError};

pub use buffered::BufferedRelay;
pub use spill::SpillFile;
pub use streaming::StreamingRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Buffered,
    Streaming,
}

impl RelayMode {
    /// Configured mode, unless the response carries a buffering hint.
    pub fn resolve(configured_buffering: bool, hint: Option<bool>) -> Self {
        if hint.unwrap_or(configured_buffering) {
            RelayMode::Buffered
        } else {
            RelayMode::Streaming
        }
    }
}

/// Buffer sizing of one upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub buffering: bool,
    pub buffer_size: usize,
    /// In-memory bytes the buffered relay may hold before spilling.
    pub threshold: usize,
    /// Zero disables spilling.
    pub max_temp_file_size: u64,
    pub temp_path: Option<PathBuf>,
}

impl RelaySettings {
    pub fn from_config(config: &BufferingConfig) -> Self {
        Self {
            buffering: config.enabled,
            buffer_size: config.buffer_size.max(1),
            threshold: config.spill_threshold().max(config.buffer_size.max(1)),
            max_temp_file_size: config.max_temp_file_size,
            temp_path: config.temp_path.clone(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&BufferingConfig::default())
    }
}

/// Byte accounting of one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Body bytes received from the peer, leftover included.
    pub upstream_bytes: u64,
    /// Bytes written downstream, header included.
    pub downstream_bytes: u64,
    /// Highest in-memory footprint, read buffer included.
    pub peak_memory: usize,
    pub spilled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// The body ended by framing and the connection carries nothing else.
    pub reusable: bool,
}

#[derive(Debug)]
enum Strategy {
    Buffered(BufferedRelay),
    Streaming(StreamingRelay),
}

impl Strategy {
    fn wants_input(&self) -> bool {
        match self {
            Strategy::Buffered(b) => b.wants_input(),
            Strategy::Streaming(s) => s.wants_input(),
        }
    }

    fn push(&mut self, chunk: Bytes) -> Result<(), UpstreamError> {
        match self {
            Strategy::Buffered(b) => b.push(chunk),
            Strategy::Streaming(s) => {
                s.push(chunk);
                Ok(())
            }
        }
    }

    fn poll_drain<W>(&mut self, cx: &mut Context<'_>, w: &mut W) -> Poll<Result<usize, UpstreamError>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self {
            Strategy::Buffered(b) => b.poll_drain(cx, w),
            Strategy::Streaming(s) => s.poll_drain(cx, w),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Strategy::Buffered(b) => b.is_empty(),
            Strategy::Streaming(s) => s.is_empty(),
        }
    }

    fn in_memory(&self) -> usize {
        match self {
            Strategy::Buffered(b) => b.in_memory(),
            Strategy::Streaming(s) => s.in_memory(),
        }
    }

    fn spilled(&self) -> u64 {
        match self {
            Strategy::Buffered(b) => b.spilled(),
            Strategy::Streaming(_) => 0,
        }
    }
}

/// Moves one response from the peer to the downstream.
#[derive(Debug)]
pub struct BodyRelay {
    mode: RelayMode,
    strategy: Strategy,
    tracker: FramingTracker,
    scratch: BytesMut,
    buffer_size: usize,
    stats: RelayStats,
    upstream_done: bool,
    upstream_eof: bool,
    /// The peer closed before the framing said the body ended.
    premature: bool,
    excess: bool,
    flushed: bool,
}

impl BodyRelay {
    pub fn new(mode: RelayMode, framing: BodyFraming, settings: &RelaySettings) -> Self {
        let strategy = match mode {
            RelayMode::Buffered => Strategy::Buffered(BufferedRelay::new(settings)),
            RelayMode::Streaming => Strategy::Streaming(StreamingRelay::new()),
        };
        let tracker = FramingTracker::new(framing);
        Self {
            mode,
            strategy,
            upstream_done: tracker.is_done(),
            tracker,
            scratch: BytesMut::new(),
            buffer_size: settings.buffer_size,
            stats: RelayStats::default(),
            upstream_eof: false,
            premature: false,
            excess: false,
            flushed: false,
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            spilled: self.strategy.spilled(),
            ..self.stats
        }
    }

    /// No more bytes will be read from the peer.
    pub fn upstream_done(&self) -> bool {
        self.upstream_done
    }

    /// Queue the response header, written downstream before any body byte.
    pub fn push_header(&mut self, raw: Bytes) -> Result<(), UpstreamError> {
        self.note_memory(raw.len());
        self.strategy.push(raw)
    }

    /// Offer body bytes received from the peer.
    pub fn ingest(
        &mut self,
        mut chunk: Bytes,
        filter: &mut dyn FnMut(Bytes) -> Option<Bytes>,
    ) -> Result<(), UpstreamError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.stats.upstream_bytes += chunk.len() as u64;

        let body = self
            .tracker
            .observe(&chunk)
            .map_err(|e| UpstreamError::io(Phase::RelayingBody, e))?;
        if body < chunk.len() {
            tracing::warn!(extra = chunk.len() - body, "Upstream sent more data than specified");
            self.excess = true;
            chunk.truncate(body);
        }
        if self.tracker.is_done() {
            self.upstream_done = true;
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let Some(out) = filter(chunk) else {
            return Ok(());
        };
        if out.is_empty() {
            return Ok(());
        }
        self.note_memory(out.len());
        self.strategy.push(out)
    }

    fn note_memory(&mut self, incoming: usize) {
        let footprint = self.strategy.in_memory() + incoming;
        self.stats.peak_memory = self.stats.peak_memory.max(footprint);
    }

    /// A short body still drains what arrived before the error surfaces.
    fn on_eof(&mut self) {
        self.upstream_eof = true;
        self.upstream_done = true;
        self.premature = !self.tracker.is_done() && !self.tracker.until_close();
    }

    /// Drive both loops until the body is fully relayed.
    pub fn poll_relay<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        upstream: &mut R,
        downstream: &mut W,
        filter: &mut dyn FnMut(Bytes) -> Option<Bytes>,
    ) -> Poll<Result<RelayOutcome, UpstreamError>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            let mut progress = false;

            if !self.upstream_done && self.strategy.wants_input() {
                match poll_read_chunk(cx, upstream, &mut self.scratch, self.buffer_size) {
                    Poll::Ready(Ok(Some(chunk))) => {
                        tracing::trace!(bytes = chunk.len(), "Upstream body read");
                        self.ingest(chunk, filter)?;
                        progress = true;
                    }
                    Poll::Ready(Ok(None)) => {
                        self.on_eof();
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(UpstreamError::io(Phase::RelayingBody, e))),
                    Poll::Pending => {}
                }
            }

            match self.strategy.poll_drain(cx, downstream) {
                Poll::Ready(Ok(0)) | Poll::Pending => {}
                Poll::Ready(Ok(n)) => {
                    self.stats.downstream_bytes += n as u64;
                    progress = true;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            }

            if self.upstream_done && self.strategy.is_empty() {
                if !self.flushed {
                    match Pin::new(&mut *downstream).poll_flush(cx) {
                        Poll::Ready(Ok(())) => self.flushed = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(UpstreamError::Downstream(e))),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                if self.premature {
                    return Poll::Ready(Err(UpstreamError::PrematureClose {
                        phase: Phase::RelayingBody,
                    }));
                }
                let reusable = self.tracker.is_done() && !self.tracker.until_close() && !self.excess && !self.upstream_eof;
                return Poll::Ready(Ok(RelayOutcome { reusable }));
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}

/// Read up to `size` bytes. `None` at EOF.
fn poll_read_chunk<R>(
    cx: &mut Context<'_>,
    io: &mut R,
    scratch: &mut BytesMut,
    size: usize,
) -> Poll<io::Result<Option<Bytes>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    scratch.clear();
    scratch.resize(size, 0);
    let mut buf = ReadBuf::new(&mut scratch[..]);
    let polled = Pin::new(io).poll_read(cx, &mut buf);
    let n = buf.filled().len();
    match polled {
        Poll::Pending => Poll::Pending,
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Ready(Ok(())) if n == 0 => Poll::Ready(Ok(None)),
        Poll::Ready(Ok(())) => {
            scratch.truncate(n);
            Poll::Ready(Ok(Some(scratch.split().freeze())))
        }
    }
}

/// Write queued chunks in order; returns bytes written this call, zero when
/// the queue is empty, Pending when blocked with data left.
fn poll_write_queue<W>(
    cx: &mut Context<'_>,
    w: &mut W,
    queue: &mut VecDeque<Bytes>,
    in_memory: &mut usize,
) -> Poll<Result<usize, UpstreamError>>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while let Some(front) = queue.front_mut() {
        match Pin::new(&mut *w).poll_write(cx, &front[..]) {
            Poll::Ready(Ok(0)) => {
                return Poll::Ready(Err(UpstreamError::Downstream(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "downstream accepted no bytes",
                ))))
            }
            Poll::Ready(Ok(n)) => {
                let _ = front.split_to(n);
                *in_memory -= n;
                written += n;
                if front.is_empty() {
                    queue.pop_front();
                }
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(UpstreamError::Downstream(e))),
            Poll::Pending if written > 0 => return Poll::Ready(Ok(written)),
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn settings(buffer_size: usize, buffers: usize) -> RelaySettings {
        RelaySettings {
            buffering: true,
            buffer_size,
            threshold: buffer_size * buffers,
            max_temp_file_size: 1 << 30,
            temp_path: None,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    /// Relay `body` (sent in `write_chunk` pieces) to a reader that takes
    /// `read_chunk` bytes every `read_delay`.
    async fn run(
        mode: RelayMode,
        settings: &RelaySettings,
        framing: BodyFraming,
        body: Vec<u8>,
        read_chunk: usize,
        read_delay: Duration,
    ) -> (Vec<u8>, RelayStats, RelayOutcome) {
        let (mut up_near, mut up_far) = tokio::io::duplex(64 * 1024);
        let (mut down_near, mut down_far) = tokio::io::duplex(read_chunk.max(1));

        let producer = tokio::spawn(async move {
            up_far.write_all(&body).await.unwrap();
        });
        let consumer = tokio::spawn(async move {
            let mut got = Vec::new();
            let mut buf = vec![0u8; read_chunk];
            loop {
                if !read_delay.is_zero() {
                    tokio::time::sleep(read_delay).await;
                }
                let n = down_far.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            got
        });

        let mut relay = BodyRelay::new(mode, framing, settings);
        relay.push_header(Bytes::from_static(b"HDR|")).unwrap();
        let mut filter = |b: Bytes| Some(b);
        let outcome = poll_fn(|cx| relay.poll_relay(cx, &mut up_near, &mut down_near, &mut filter))
            .await
            .unwrap();
        drop(down_near);
        producer.await.unwrap();

        (consumer.await.unwrap(), relay.stats(), outcome)
    }

    #[tokio::test]
    async fn modes_deliver_identical_bytes() {
        let body = pattern(300_000);
        let framing = BodyFraming::Length(body.len() as u64);
        let s = settings(4096, 4);

        let (buffered, bstats, bout) =
            run(RelayMode::Buffered, &s, framing, body.clone(), 1000, Duration::ZERO).await;
        let (streaming, sstats, sout) =
            run(RelayMode::Streaming, &s, framing, body.clone(), 1000, Duration::ZERO).await;

        let mut expected = b"HDR|".to_vec();
        expected.extend_from_slice(&body);
        assert_eq!(buffered, expected);
        assert_eq!(streaming, expected);
        assert!(bout.reusable && sout.reusable);
        assert_eq!(bstats.upstream_bytes, body.len() as u64);
        assert!(sstats.peak_memory <= 4096 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_client_spills_with_bounded_memory() {
        // 10 MiB body, 1 MiB threshold, downstream reads a tenth of a buffer per tick
        let buffer_size = 8192;
        let s = settings(buffer_size, 128);
        let body = pattern(10 * 1024 * 1024);
        let framing = BodyFraming::Length(body.len() as u64);

        let (got, stats, outcome) = run(
            RelayMode::Buffered,
            &s,
            framing,
            body.clone(),
            buffer_size,
            Duration::from_millis(1),
        )
        .await;

        assert!(outcome.reusable);
        assert_eq!(got.len(), body.len() + 4);
        assert_eq!(&got[4..], &body[..]);
        assert_eq!(stats.upstream_bytes, body.len() as u64);
        assert_eq!(stats.downstream_bytes, body.len() as u64 + 4);
        assert!(stats.peak_memory <= s.threshold + buffer_size, "peak {}", stats.peak_memory);
        assert!(stats.spilled > 0);
    }

    #[tokio::test]
    async fn premature_close_is_reported() {
        let (mut up_near, mut up_far) = tokio::io::duplex(1024);
        let (mut down_near, _down_far) = tokio::io::duplex(1024);
        up_far.write_all(b"short").await.unwrap();
        drop(up_far);

        let mut relay = BodyRelay::new(RelayMode::Streaming, BodyFraming::Length(100), &settings(64, 2));
        let mut filter = |b: Bytes| Some(b);
        let err = poll_fn(|cx| relay.poll_relay(cx, &mut up_near, &mut down_near, &mut filter))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::PrematureClose { phase: Phase::RelayingBody }));
        assert_eq!(relay.stats().upstream_bytes, 5);
        // what arrived was still passed on
        assert_eq!(relay.stats().downstream_bytes, 5);
    }

    #[tokio::test]
    async fn until_close_is_not_reusable_and_excess_is_dropped() {
        let s = settings(64, 2);
        let (got, _, outcome) = run(
            RelayMode::Streaming,
            &s,
            BodyFraming::UntilClose,
            b"abc".to_vec(),
            16,
            Duration::ZERO,
        )
        .await;
        assert_eq!(got, b"HDR|abc");
        assert!(!outcome.reusable);

        let (got, _, outcome) =
            run(RelayMode::Buffered, &s, BodyFraming::Length(2), b"abc".to_vec(), 16, Duration::ZERO).await;
        assert_eq!(got, b"HDR|ab");
        assert!(!outcome.reusable);
    }

    #[test]
    fn buffering_hint_overrides() {
        assert_eq!(RelayMode::resolve(true, None), RelayMode::Buffered);
        assert_eq!(RelayMode::resolve(true, Some(false)), RelayMode::Streaming);
        assert_eq!(RelayMode::resolve(false, Some(true)), RelayMode::Buffered);
    }
}
