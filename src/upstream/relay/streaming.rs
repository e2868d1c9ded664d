//! Streaming relay: one buffer in flight.
//!
//! The next upstream read happens only after the previous one has been
//! written out completely, so memory stays at one buffer and a slow client
//! directly slows the reads from the peer.

use std::collections::VecDeque;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::upstream::relay::poll_write_queue;
use crate::upstream::UpstreamError;

#[derive(Debug, Default)]
pub struct StreamingRelay {
    pending: VecDeque<Bytes>,
    in_memory: usize,
}

impl StreamingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only an empty buffer is refilled.
    pub fn wants_input(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.in_memory += chunk.len();
        self.pending.push_back(chunk);
    }

    pub fn poll_drain<W>(&mut self, cx: &mut Context<'_>, w: &mut W) -> Poll<Result<usize, UpstreamError>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        poll_write_queue(cx, w, &mut self.pending, &mut self.in_memory)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_memory(&self) -> usize {
        self.in_memory
    }
}
