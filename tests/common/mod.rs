//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use upstream_proxy::config::{BalanceMethod, ServerConfig};
use upstream_proxy::http::Http1Protocol;
use upstream_proxy::load_balancer::{Peer, PeerSet, SelectedPeer, UpstreamPeers};
use upstream_proxy::upstream::{Connect, Connection, TcpConnector, Upstream, UpstreamError};
use upstream_proxy::{SessionReport, UpstreamSession};

/// A mock backend on an ephemeral localhost port.
pub struct Backend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Backend {
    /// Answer every request with `response(n)`, `n` counting from 0, and
    /// close the connection.
    pub async fn start<F>(response: F) -> Self
    where
        F: Fn(usize) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let response = Arc::new(response);

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let response = Arc::clone(&response);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    if read_request(&mut socket).await.is_none() {
                        return;
                    }
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let _ = socket.write_all(&response(n)).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, hits }
    }

    /// Always answer with `status` and `body`.
    pub async fn fixed(status: u16, body: &'static str) -> Self {
        Self::start(move |_| http_response(status, body.as_bytes())).await
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Read one request head plus its `Content-Length` body.
async fn read_request(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return Some(buf);
            }
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub fn http_response(status: u16, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status} Mock\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// An address with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Connector whose connects to `hang` never complete.
#[derive(Debug, Default)]
pub struct BlackholeConnector {
    hang: HashSet<SocketAddr>,
    inner: TcpConnector,
}

impl BlackholeConnector {
    pub fn new(hang: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            hang: hang.into_iter().collect(),
            inner: TcpConnector::new(),
        }
    }
}

#[async_trait]
impl Connect for BlackholeConnector {
    async fn connect(&self, peer: &SelectedPeer) -> Result<Connection, UpstreamError> {
        if self.hang.contains(&peer.addr()) {
            std::future::pending::<()>().await;
        }
        self.inner.connect(peer).await
    }
}

/// An upstream of `(name, addr, weight)` primary peers.
pub fn upstream_with(peers: &[(&str, SocketAddr, u32)], connector: Arc<dyn Connect>) -> Upstream {
    let peers = peers
        .iter()
        .map(|(name, addr, weight)| Peer::new(*name, *addr, &ServerConfig::new(*name).weight(*weight)))
        .collect();
    let set = PeerSet::new("test", peers, false, BalanceMethod::RoundRobin);
    Upstream::new("test", UpstreamPeers::new(set, None), connector)
}

pub fn get(path: &str) -> Http1Protocol {
    let mut headers = HeaderMap::new();
    headers.insert("host", "backend.test".parse().unwrap());
    Http1Protocol::new(Method::GET, path.parse().unwrap(), headers, Bytes::new())
}

/// Drive one GET through `upstream`, collecting the downstream bytes.
pub async fn drive(upstream: &Arc<Upstream>) -> (SessionReport, Vec<u8>) {
    let (session, _cancel) = UpstreamSession::start(Arc::clone(upstream), get("/")).unwrap();
    let mut out = Vec::new();
    let report = session.drive(&mut out).await;
    (report, out)
}

/// Downstream that takes at most `chunk` bytes per write and pauses after
/// every `burst` bytes.
pub struct SlowClient {
    pub received: Vec<u8>,
    chunk: usize,
    burst: usize,
    since_pause: usize,
    pause: Duration,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl SlowClient {
    pub fn new(chunk: usize, burst: usize, pause: Duration) -> Self {
        Self {
            received: Vec::new(),
            chunk,
            burst,
            since_pause: 0,
            pause,
            sleep: None,
        }
    }
}

impl AsyncWrite for SlowClient {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.sleep = None;
        }
        let n = buf.len().min(this.chunk);
        this.received.extend_from_slice(&buf[..n]);
        this.since_pause += n;
        if this.since_pause >= this.burst {
            this.since_pause = 0;
            this.sleep = Some(Box::pin(tokio::time::sleep(this.pause)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
