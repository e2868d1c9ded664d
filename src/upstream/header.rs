//! Response header reader.
//!
//! Accumulates bytes from the peer until the protocol's parser recognizes a
//! complete header, enforcing the configured maximum header size. Bytes
//! after the header are kept for the body relay.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};

use crate::upstream::{HeaderParse, ParsedHeader, Phase, UpstreamError};

/// A recognized response header.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub parsed: ParsedHeader,
    /// Header bytes exactly as received.
    pub raw: Bytes,
    /// Body bytes that arrived together with the header.
    pub leftover: Bytes,
}

#[derive(Debug)]
pub enum HeaderStatus {
    NeedMore,
    Header(ResponseHead),
}

#[derive(Debug)]
pub struct ResponseHeaderReader {
    buf: BytesMut,
    max: usize,
    received: usize,
}

impl ResponseHeaderReader {
    pub fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max.min(4096)),
            max,
            received: 0,
        }
    }

    /// Bytes received from the peer so far, interim responses included.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Append `bytes` and try the parser.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        parser: &mut dyn FnMut(&[u8]) -> HeaderParse,
    ) -> Result<HeaderStatus, UpstreamError> {
        self.buf.extend_from_slice(bytes);
        self.received += bytes.len();
        self.parse(parser)
    }

    fn parse(&mut self, parser: &mut dyn FnMut(&[u8]) -> HeaderParse) -> Result<HeaderStatus, UpstreamError> {
        loop {
            match parser(&self.buf) {
                HeaderParse::NeedMore => {
                    if self.buf.len() >= self.max {
                        return Err(UpstreamError::HeaderTooLarge);
                    }
                    return Ok(HeaderStatus::NeedMore);
                }
                HeaderParse::Interim(len) => {
                    let _ = self.buf.split_to(len.min(self.buf.len()));
                }
                HeaderParse::Parsed(parsed) => {
                    let raw = self.buf.split_to(parsed.header_len.min(self.buf.len())).freeze();
                    let leftover = self.buf.split().freeze();
                    return Ok(HeaderStatus::Header(ResponseHead { parsed, raw, leftover }));
                }
                HeaderParse::Invalid(reason) => return Err(UpstreamError::InvalidHeader(reason)),
            }
        }
    }

    /// Read from `io` until a header is recognized.
    pub fn poll_read<R>(
        &mut self,
        cx: &mut Context<'_>,
        io: &mut R,
        parser: &mut dyn FnMut(&[u8]) -> HeaderParse,
    ) -> Poll<Result<ResponseHead, UpstreamError>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            let room = self.max.saturating_sub(self.buf.len());
            if room == 0 {
                return Poll::Ready(Err(UpstreamError::HeaderTooLarge));
            }

            let start = self.buf.len();
            self.buf.resize(start + room.min(4096), 0);
            let mut read_buf = ReadBuf::new(&mut self.buf[start..]);
            let polled = Pin::new(&mut *io).poll_read(cx, &mut read_buf);
            let n = read_buf.filled().len();
            self.buf.truncate(start + n);

            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(UpstreamError::io(Phase::ReadingHeader, e))),
                Poll::Ready(Ok(())) if n == 0 => {
                    return Poll::Ready(Err(UpstreamError::PrematureClose {
                        phase: Phase::ReadingHeader,
                    }))
                }
                Poll::Ready(Ok(())) => {}
            }

            self.received += n;
            match self.parse(parser) {
                Ok(HeaderStatus::NeedMore) => continue,
                Ok(HeaderStatus::Header(head)) => return Poll::Ready(Ok(head)),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::framing::BodyFraming;
    use http::StatusCode;
    use std::future::poll_fn;
    use tokio::io::AsyncWriteExt;

    /// Header ends at the first blank line; "1" as first byte marks interim.
    fn parser(buf: &[u8]) -> HeaderParse {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return HeaderParse::NeedMore;
        };
        if buf.starts_with(b"bad") {
            return HeaderParse::Invalid("bad".into());
        }
        if buf.starts_with(b"1") {
            return HeaderParse::Interim(end + 4);
        }
        HeaderParse::Parsed(ParsedHeader {
            status: StatusCode::OK,
            header_len: end + 4,
            framing: BodyFraming::UntilClose,
            keep_alive: false,
            buffering: None,
            cacheable: true,
        })
    }

    #[test]
    fn feed_keeps_leftover() {
        let mut reader = ResponseHeaderReader::new(1024);
        let mut p = parser;
        assert!(matches!(reader.feed(b"200 OK\r\n", &mut p).unwrap(), HeaderStatus::NeedMore));
        let HeaderStatus::Header(head) = reader.feed(b"\r\nbody", &mut p).unwrap() else {
            panic!("expected header");
        };
        assert_eq!(&head.raw[..], b"200 OK\r\n\r\n");
        assert_eq!(&head.leftover[..], b"body");
    }

    #[test]
    fn interim_responses_are_dropped() {
        let mut reader = ResponseHeaderReader::new(1024);
        let mut p = parser;
        let HeaderStatus::Header(head) = reader.feed(b"100 Continue\r\n\r\n200 OK\r\n\r\n", &mut p).unwrap() else {
            panic!("expected header");
        };
        assert_eq!(&head.raw[..], b"200 OK\r\n\r\n");
        assert!(head.leftover.is_empty());
    }

    #[test]
    fn oversized_and_invalid() {
        let mut reader = ResponseHeaderReader::new(8);
        let mut p = parser;
        assert!(matches!(reader.feed(b"200 OK\r\nX: y", &mut p), Err(UpstreamError::HeaderTooLarge)));

        let mut reader = ResponseHeaderReader::new(64);
        assert!(matches!(reader.feed(b"bad\r\n\r\n", &mut p), Err(UpstreamError::InvalidHeader(_))));
    }

    #[tokio::test]
    async fn poll_read_from_stream() {
        let (mut near, mut far) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            far.write_all(b"200 OK\r\nServer: test\r\n\r\nhello").await.unwrap();
            far
        });

        let mut reader = ResponseHeaderReader::new(1024);
        let mut p = parser;
        let head = poll_fn(|cx| reader.poll_read(cx, &mut near, &mut p)).await.unwrap();
        assert_eq!(&head.raw[..], b"200 OK\r\nServer: test\r\n\r\n");
        let _far = writer.await.unwrap();
        assert!(head.leftover.len() <= 5);
    }

    #[tokio::test]
    async fn eof_before_header() {
        let (mut near, mut far) = tokio::io::duplex(16);
        far.write_all(b"200 OK\r\n").await.unwrap();
        drop(far);

        let mut reader = ResponseHeaderReader::new(1024);
        let mut p = parser;
        let err = poll_fn(|cx| reader.poll_read(cx, &mut near, &mut p)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::PrematureClose { phase: Phase::ReadingHeader }));
    }
}
