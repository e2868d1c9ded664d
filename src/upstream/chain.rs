//! Request buffer chain.
//!
//! An ordered list of owned byte segments with a read cursor. The forwarder
//! consumes the chain by advancing the cursor; a retry rewinds the cursor
//! instead of rebuilding the request. Segments may be appended while a
//! streamed request body is still arriving.

use std::io::IoSlice;

use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct BufferChain {
    segments: Vec<Bytes>,
    /// Segment under the cursor.
    index: usize,
    /// Offset into `segments[index]`.
    offset: usize,
    len: usize,
    consumed: usize,
    complete: bool,
}

impl BufferChain {
    /// An open chain; call `finish` once every segment has been pushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A complete chain holding `segments`.
    pub fn from_segments(segments: impl IntoIterator<Item = Bytes>) -> Self {
        let mut chain = Self::new();
        for segment in segments {
            chain.push(segment);
        }
        chain.finish();
        chain
    }

    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push(segment);
    }

    /// No more segments will be pushed.
    pub fn finish(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Total bytes pushed so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes behind the cursor.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes ahead of the cursor.
    pub fn remaining(&self) -> usize {
        self.len - self.consumed
    }

    /// Cursor is at the end of every pushed segment.
    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    /// Fully pushed and fully consumed.
    pub fn is_sent(&self) -> bool {
        self.complete && self.is_drained()
    }

    /// Fill `dst` with slices of the unsent bytes, returns how many were set.
    pub fn io_slices<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        let mut offset = self.offset;
        for segment in &self.segments[self.index.min(self.segments.len())..] {
            if filled == dst.len() {
                break;
            }
            let rest = &segment[offset..];
            offset = 0;
            if rest.is_empty() {
                continue;
            }
            dst[filled] = IoSlice::new(rest);
            filled += 1;
        }
        filled
    }

    /// Move the cursor forward by `n` bytes.
    pub fn advance(&mut self, mut n: usize) {
        n = n.min(self.remaining());
        self.consumed += n;
        while n > 0 {
            let available = self.segments[self.index].len() - self.offset;
            if n < available {
                self.offset += n;
                return;
            }
            n -= available;
            self.index += 1;
            self.offset = 0;
        }
        while self.index < self.segments.len() && self.offset == self.segments[self.index].len() {
            self.index += 1;
            self.offset = 0;
        }
    }

    /// Put the cursor back at the first byte.
    pub fn rewind(&mut self) {
        self.index = 0;
        self.offset = 0;
        self.consumed = 0;
    }

    /// Copy of the unsent bytes, in order.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining());
        let mut slices = vec![IoSlice::new(&[]); self.segments.len()];
        let n = self.io_slices(&mut slices);
        for slice in &slices[..n] {
            out.extend_from_slice(slice);
        }
        out
    }
}
