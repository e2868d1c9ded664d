//! Request forwarder.
//!
//! Streams the request chain to the connected peer. A short write leaves
//! the cursor on the first unsent byte; the writer has registered for
//! writability and the next call continues from there. Body segments still
//! arriving from the client are appended to the chain between calls.

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::upstream::BufferChain;

/// Slices handed to one vectored write.
const MAX_IOVECS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every byte of the finished chain was written and flushed.
    Complete,
    /// Blocked on the writer or on the client body; `remaining` bytes of
    /// the chain are known and unsent.
    Partial { remaining: usize },
}

#[derive(Debug)]
pub struct RequestForwarder {
    chain: BufferChain,
    body: Option<mpsc::Receiver<Bytes>>,
    flushed: bool,
}

impl RequestForwarder {
    pub fn new(chain: BufferChain, body: Option<mpsc::Receiver<Bytes>>) -> Self {
        let mut chain = chain;
        if body.is_none() {
            chain.finish();
        }
        Self {
            chain,
            body,
            flushed: false,
        }
    }

    pub fn chain(&self) -> &BufferChain {
        &self.chain
    }

    /// Bytes written in the current attempt.
    pub fn sent(&self) -> usize {
        self.chain.consumed()
    }

    pub fn is_complete(&self) -> bool {
        self.flushed && self.chain.is_sent()
    }

    /// Start over for a retry; the chain is rewound, not rebuilt.
    pub fn rewind(&mut self) {
        self.chain.rewind();
        self.flushed = false;
    }

    fn poll_body(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(rx) = self.body.as_mut() else {
            self.chain.finish();
            return Poll::Ready(());
        };
        loop {
            match rx.poll_recv(cx) {
                Poll::Ready(Some(segment)) => self.chain.push(segment),
                Poll::Ready(None) => {
                    self.body = None;
                    self.chain.finish();
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Write as much of the chain as `io` accepts right now.
    pub fn send<W>(&mut self, cx: &mut Context<'_>, io: &mut W) -> Result<SendStatus, io::Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.chain.is_drained() {
                if !self.chain.is_complete() {
                    if self.poll_body(cx).is_pending() && self.chain.is_drained() {
                        return Ok(SendStatus::Partial { remaining: 0 });
                    }
                    continue;
                }
                if !self.flushed {
                    match Pin::new(&mut *io).poll_flush(cx) {
                        Poll::Ready(Ok(())) => self.flushed = true,
                        Poll::Ready(Err(e)) => return Err(e),
                        Poll::Pending => return Ok(SendStatus::Partial { remaining: 0 }),
                    }
                }
                return Ok(SendStatus::Complete);
            }

            let mut slices = [IoSlice::new(&[]); MAX_IOVECS];
            let count = self.chain.io_slices(&mut slices);
            let written = match Pin::new(&mut *io).poll_write_vectored(cx, &slices[..count]) {
                Poll::Ready(Ok(0)) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "upstream accepted no bytes"))
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {
                    return Ok(SendStatus::Partial {
                        remaining: self.chain.remaining(),
                    })
                }
            };
            self.chain.advance(written);
            tracing::trace!(written, remaining = self.chain.remaining(), "Request bytes sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use tokio::io::AsyncReadExt;

    async fn send_all<W: AsyncWrite + Unpin>(forwarder: &mut RequestForwarder, io: &mut W) {
        poll_fn(|cx| match forwarder.send(cx, io) {
            Ok(SendStatus::Complete) => Poll::Ready(()),
            Ok(SendStatus::Partial { .. }) => Poll::Pending,
            Err(e) => panic!("send failed: {e}"),
        })
        .await
    }

    fn random_segments(data: &[u8]) -> Vec<Bytes> {
        let mut segments = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let n = fastrand::usize(1..=rest.len().min(97));
            segments.push(Bytes::copy_from_slice(&rest[..n]));
            rest = &rest[n..];
        }
        segments
    }

    #[tokio::test]
    async fn partial_writes_preserve_bytes() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        for capacity in [1, 7, 64, 4096] {
            let (mut near, mut far) = tokio::io::duplex(capacity);
            let reader = tokio::spawn(async move {
                let mut got = Vec::new();
                far.read_to_end(&mut got).await.unwrap();
                got
            });

            let mut forwarder = RequestForwarder::new(BufferChain::from_segments(random_segments(&data)), None);
            send_all(&mut forwarder, &mut near).await;
            drop(near);

            assert_eq!(reader.await.unwrap(), data, "capacity {capacity}");
        }
    }

    #[tokio::test]
    async fn short_write_reports_remaining() {
        let (mut near, _far) = tokio::io::duplex(4);
        let mut forwarder = RequestForwarder::new(BufferChain::from_segments([Bytes::from_static(b"0123456789")]), None);

        let status = poll_fn(|cx| Poll::Ready(forwarder.send(cx, &mut near))).await.unwrap();
        assert_eq!(status, SendStatus::Partial { remaining: 6 });
        assert_eq!(forwarder.sent(), 4);
    }

    #[tokio::test]
    async fn streamed_body_and_rewind() {
        let (tx, rx) = mpsc::channel(4);
        let mut chain = BufferChain::new();
        chain.push(Bytes::from_static(b"HEAD|"));
        let mut forwarder = RequestForwarder::new(chain, Some(rx));

        let (mut near, mut far) = tokio::io::duplex(1024);
        let status = poll_fn(|cx| Poll::Ready(forwarder.send(cx, &mut near))).await.unwrap();
        assert_eq!(status, SendStatus::Partial { remaining: 0 });

        tx.send(Bytes::from_static(b"part1|")).await.unwrap();
        tx.send(Bytes::from_static(b"part2")).await.unwrap();
        drop(tx);
        send_all(&mut forwarder, &mut near).await;
        assert!(forwarder.is_complete());

        // a retry resends the whole chain, body included
        forwarder.rewind();
        send_all(&mut forwarder, &mut near).await;
        drop(near);

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"HEAD|part1|part2HEAD|part1|part2");
    }
}
