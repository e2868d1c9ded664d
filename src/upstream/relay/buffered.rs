//! Buffered relay: reads from the peer as fast as it sends.
//!
//! Bytes the client has not taken yet stay in memory up to the threshold;
//! beyond it they go to a temp file. Write order is memory queue, then the
//! file, then memory again once the file has been drained. While the file
//! holds unread bytes every new byte is appended to it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::observability::metrics;
use crate::upstream::relay::{poll_write_queue, RelaySettings, SpillFile};
use crate::upstream::UpstreamError;

#[derive(Debug)]
pub struct BufferedRelay {
    queue: VecDeque<Bytes>,
    in_memory: usize,
    threshold: usize,
    buffer_size: usize,
    max_temp_file_size: u64,
    temp_path: Option<PathBuf>,
    spill: Option<SpillFile>,
    spilled: u64,
}

impl BufferedRelay {
    pub fn new(settings: &RelaySettings) -> Self {
        Self {
            queue: VecDeque::new(),
            in_memory: 0,
            threshold: settings.threshold,
            buffer_size: settings.buffer_size,
            max_temp_file_size: settings.max_temp_file_size,
            temp_path: settings.temp_path.clone(),
            spill: None,
            spilled: 0,
        }
    }

    fn spilling(&self) -> bool {
        self.spill.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// `max_temp_file_size` bounds the file on disk, including bytes already
    /// read back; the file resets only once fully drained.
    fn spill_has_room(&self) -> bool {
        let used = self.spill.as_ref().map_or(0, |s| s.disk_len());
        self.max_temp_file_size > 0 && used + self.buffer_size as u64 <= self.max_temp_file_size
    }

    /// Another full buffer fits in memory or in the temp file.
    pub fn wants_input(&self) -> bool {
        if self.spilling() {
            return self.spill_has_room();
        }
        self.in_memory + self.buffer_size <= self.threshold || self.spill_has_room()
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<(), UpstreamError> {
        if !self.spilling() && (self.in_memory + chunk.len() <= self.threshold || !self.spill_has_room()) {
            self.in_memory += chunk.len();
            self.queue.push_back(chunk);
            return Ok(());
        }

        if self.spill.is_none() {
            let file = SpillFile::create(self.temp_path.as_deref()).map_err(UpstreamError::Storage)?;
            tracing::debug!(threshold = self.threshold, "Buffering response to temporary file");
            self.spill = Some(file);
        }
        if let Some(spill) = self.spill.as_mut() {
            spill.append(&chunk).map_err(UpstreamError::Storage)?;
        }
        self.spilled += chunk.len() as u64;
        metrics::record_spilled(chunk.len() as u64);
        Ok(())
    }

    pub fn poll_drain<W>(&mut self, cx: &mut Context<'_>, w: &mut W) -> Poll<Result<usize, UpstreamError>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0;
        loop {
            if self.queue.is_empty() {
                let Some(spill) = self.spill.as_mut().filter(|s| !s.is_empty()) else {
                    return Poll::Ready(Ok(written));
                };
                let chunk = spill.read_chunk(self.buffer_size).map_err(UpstreamError::Storage)?;
                self.in_memory += chunk.len();
                self.queue.push_back(chunk);
            }

            match poll_write_queue(cx, w, &mut self.queue, &mut self.in_memory) {
                Poll::Ready(Ok(n)) if self.queue.is_empty() => written += n,
                Poll::Ready(Ok(n)) => return Poll::Ready(Ok(written + n)),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending if written > 0 => return Poll::Ready(Ok(written)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && !self.spilling()
    }

    pub fn in_memory(&self) -> usize {
        self.in_memory
    }

    pub fn spilled(&self) -> u64 {
        self.spilled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_temp_file_size: u64) -> RelaySettings {
        RelaySettings {
            buffering: true,
            buffer_size: 4,
            threshold: 8,
            max_temp_file_size,
            temp_path: None,
        }
    }

    #[test]
    fn spills_beyond_threshold_in_order() {
        let mut relay = BufferedRelay::new(&settings(1024));
        relay.push(Bytes::from_static(b"aaaa")).unwrap();
        relay.push(Bytes::from_static(b"bbbb")).unwrap();
        assert!(relay.wants_input());
        relay.push(Bytes::from_static(b"cccc")).unwrap();
        // small chunk still goes to the file while it has unread bytes
        relay.push(Bytes::from_static(b"d")).unwrap();

        assert_eq!(relay.in_memory(), 8);
        assert_eq!(relay.spilled(), 5);
        assert!(!relay.is_empty());
    }

    #[test]
    fn without_temp_file_reads_stop_at_threshold() {
        let mut relay = BufferedRelay::new(&settings(0));
        relay.push(Bytes::from_static(b"aaaa")).unwrap();
        assert!(relay.wants_input());
        relay.push(Bytes::from_static(b"bbbb")).unwrap();
        assert!(!relay.wants_input());
        assert_eq!(relay.spilled(), 0);
    }

    #[test]
    fn file_limit_counts_bytes_already_read() {
        let mut relay = BufferedRelay::new(&settings(12));
        for chunk in [&b"aaaa"[..], b"bbbb", b"cccc", b"dddd", b"eeee"] {
            relay.push(Bytes::copy_from_slice(chunk)).unwrap();
        }
        assert!(!relay.wants_input());

        // a client one chunk behind does not let the file grow further
        let spill = relay.spill.as_mut().unwrap();
        assert_eq!(&spill.read_chunk(4).unwrap()[..], b"cccc");
        assert_eq!((spill.unread(), spill.disk_len()), (8, 12));
        assert!(!relay.wants_input());

        let spill = relay.spill.as_mut().unwrap();
        spill.read_chunk(8).unwrap();
        assert_eq!(spill.disk_len(), 0);
        assert!(relay.wants_input());
    }

    #[tokio::test]
    async fn drains_memory_then_file() {
        use tokio::io::AsyncReadExt;

        let mut relay = BufferedRelay::new(&settings(1024));
        for chunk in [&b"aaaa"[..], b"bbbb", b"cccc", b"dd"] {
            relay.push(Bytes::copy_from_slice(chunk)).unwrap();
        }

        let (mut near, mut far) = tokio::io::duplex(64);
        std::future::poll_fn(|cx| relay.poll_drain(cx, &mut near)).await.unwrap();
        assert!(relay.is_empty());

        // memory is used again once the file is drained
        relay.push(Bytes::from_static(b"ee")).unwrap();
        assert_eq!(relay.spilled(), 6);
        std::future::poll_fn(|cx| relay.poll_drain(cx, &mut near)).await.unwrap();
        drop(near);

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"aaaabbbbccccddee");
    }
}
