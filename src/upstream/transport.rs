//! Upstream transports and the connection handle.
//!
//! # Responsibilities
//! - Abstract over plain TCP, TLS over TCP and in-memory pipes
//! - Detect a peer-initiated close on an idle connection without
//!   consuming application data (peek)
//! - Carry per-connection bookkeeping used by the keepalive pool

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;

use crate::net::connection::ConnectionId;

/// A byte stream to a peer.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug + 'static {
    /// Ready once an idle connection can no longer be reused: the peer closed
    /// it, the socket errored, or unsolicited bytes arrived. Pending while
    /// the connection looks healthy.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()>;
}

fn peek_closed(stream: &TcpStream, cx: &mut Context<'_>) -> Poll<()> {
    let mut byte = [0u8; 1];
    let mut buf = ReadBuf::new(&mut byte);
    match stream.poll_peek(cx, &mut buf) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(Ok(0)) => Poll::Ready(()),
        Poll::Ready(Ok(_)) => {
            tracing::debug!("Upstream sent unexpected data while idle");
            Poll::Ready(())
        }
        Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
        Poll::Ready(Err(_)) => Poll::Ready(()),
    }
}

impl Transport for TcpStream {
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        peek_closed(self, cx)
    }
}

impl Transport for TlsStream<TcpStream> {
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        // close_notify arrives as readable bytes on the raw socket
        peek_closed(self.get_ref().0, cx)
    }
}

/// In-memory pipe. Idle detection reads instead of peeking; whatever is
/// read marks the connection unusable anyway.
impl Transport for DuplexStream {
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match Pin::new(self).poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(_) => Poll::Ready(()),
        }
    }
}

/// An established connection to one peer address.
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    io: Box<dyn Transport>,
    created: Instant,
    requests: u32,
    reused: bool,
}

impl Connection {
    pub fn new(addr: SocketAddr, io: impl Transport) -> Self {
        Self {
            id: ConnectionId::new(),
            addr,
            io: Box::new(io),
            created: Instant::now(),
            requests: 0,
            reused: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests started on this connection.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Taken from the keepalive pool rather than freshly connected.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub(crate) fn mark_reused(&mut self) {
        self.reused = true;
    }

    pub(crate) fn start_request(&mut self) {
        self.requests += 1;
    }

    pub fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.io.poll_closed(cx)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("requests", &self.requests)
            .field("reused", &self.reused)
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}
