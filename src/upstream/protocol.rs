//! Backend protocol seam.
//!
//! The engine moves bytes; an `UpstreamProtocol` implementation decides what
//! those bytes mean. It builds the outbound request, recognizes a complete
//! response header and may filter body bytes. One instance serves one
//! session and sees every attempt of it.

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::mpsc;

use crate::upstream::{framing::BodyFraming, BufferChain, UpstreamError};

/// Normalized fields of a response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub status: StatusCode,
    /// Bytes from the start of the buffer up to the first body byte.
    pub header_len: usize,
    pub framing: BodyFraming,
    /// The peer allows another request on this connection.
    pub keep_alive: bool,
    /// Per-response relay mode override (`X-Accel-Buffering`).
    pub buffering: Option<bool>,
    /// The response may be stored (no `no-store` / `private`).
    pub cacheable: bool,
}

/// Result of offering the accumulated bytes to the header parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParse {
    NeedMore,
    /// A complete interim (1xx) response of this many bytes; it is dropped
    /// and parsing restarts after it.
    Interim(usize),
    Parsed(ParsedHeader),
    Invalid(String),
}

/// Per-session backend protocol callbacks.
pub trait UpstreamProtocol: Send {
    /// Build the outbound request. `keepalive` tells whether the connection
    /// may be cached afterwards.
    fn create_request(&mut self, keepalive: bool) -> Result<BufferChain, UpstreamError>;

    /// Body bytes still arriving from the client, appended to the request
    /// chain as they come. Taken once, on the first attempt.
    fn request_body(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        None
    }

    /// Recognize a complete response header at the start of `buf`.
    fn process_header(&mut self, buf: &[u8]) -> HeaderParse;

    /// Transform or consume body bytes before they are relayed.
    fn input_filter(&mut self, chunk: Bytes) -> Option<Bytes> {
        Some(chunk)
    }

    /// Reset protocol state before a retry.
    fn reinit_request(&mut self) {}

    /// The session was cancelled or failed before completion.
    fn abort_request(&mut self) {}

    /// The session finished with `status`.
    fn finalize_request(&mut self, _status: StatusCode) {}

    /// Safe to resend after bytes reached a peer.
    fn is_idempotent(&self) -> bool {
        true
    }

    /// The response is being captured for storage; the transfer continues
    /// after the client leaves.
    fn store_response(&self) -> bool {
        false
    }
}
