//! Keepalive connection pool.
//!
//! # Responsibilities
//! - Cache idle upstream connections keyed by peer address
//! - Detect peer-initiated closes while a connection sits idle
//! - Bound the cache size with LRU eviction
//!
//! # Data Flow
//! ```text
//! release(conn, reusable)
//!     → not reusable / limits reached / shutting down → close
//!     → cache full → evict least recently used (back of the queue)
//!     → push to front, spawn close detector (peek + idle timeout)
//!
//! acquire(addr)
//!     → scan the most recent entries for addr
//!     → re-check the detector synchronously, closed entries are dropped
//!     → hand out the connection, detector aborted
//! ```
//!
//! # Design Decisions
//! - acquire and release never block; the lock is never held across await
//! - The scan is bounded; old entries are left for eviction instead

use std::collections::VecDeque;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::task::noop_waker_ref;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::KeepaliveConfig;
use crate::observability::metrics;
use crate::upstream::Connection;

/// Entries inspected per acquire, most recent first.
const ACQUIRE_SCAN_LIMIT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
    /// Maximum number of cached connections; zero disables caching.
    pub capacity: usize,
    pub idle_timeout: Duration,
    /// Zero means unlimited.
    pub max_requests: u32,
    pub max_lifetime: Duration,
}

impl KeepaliveSettings {
    pub fn from_config(config: &KeepaliveConfig) -> Self {
        Self {
            capacity: config.capacity,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            max_requests: config.max_requests,
            max_lifetime: Duration::from_millis(config.max_lifetime_ms),
        }
    }
}

#[derive(Debug)]
struct Cached {
    key: u64,
    conn: Connection,
    idle_since: Instant,
    detector: Option<AbortHandle>,
}

impl Cached {
    fn close(self, reason: &'static str) {
        if let Some(detector) = &self.detector {
            detector.abort();
        }
        tracing::debug!(connection_id = %self.conn.id(), addr = %self.conn.addr(), reason, "Closing cached upstream connection");
    }
}

#[derive(Debug, Default)]
struct PoolState {
    cache: VecDeque<Cached>,
    next_key: u64,
    shutting_down: bool,
}

#[derive(Debug)]
struct PoolInner {
    upstream: String,
    settings: KeepaliveSettings,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Idle connection cache of one upstream.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(upstream: impl Into<String>, settings: KeepaliveSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                upstream: upstream.into(),
                settings,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settings.capacity > 0
    }

    pub fn settings(&self) -> &KeepaliveSettings {
        &self.inner.settings
    }

    /// Number of cached connections.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn idle_count_for(&self, addr: SocketAddr) -> usize {
        self.inner.lock().cache.iter().filter(|c| c.conn.addr() == addr).count()
    }

    /// Take a cached connection to `addr`, if a live one exists.
    pub fn acquire(&self, addr: SocketAddr) -> Option<Connection> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.inner.lock();
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut index = 0;
        let mut scanned = 0;
        while index < state.cache.len() && scanned < ACQUIRE_SCAN_LIMIT {
            scanned += 1;
            if state.cache[index].conn.addr() != addr {
                index += 1;
                continue;
            }
            let Some(mut entry) = state.cache.remove(index) else {
                break;
            };

            if entry.conn.poll_closed(&mut cx).is_ready() {
                metrics::record_keepalive(&self.inner.upstream, "closed");
                entry.close("closed by peer");
                continue;
            }
            if entry.conn.age() >= self.inner.settings.max_lifetime {
                entry.close("lifetime exceeded");
                continue;
            }

            if let Some(detector) = entry.detector.take() {
                detector.abort();
            }
            let mut conn = entry.conn;
            conn.mark_reused();
            tracing::debug!(
                upstream = %self.inner.upstream,
                connection_id = %conn.id(),
                addr = %addr,
                idle_ms = entry.idle_since.elapsed().as_millis() as u64,
                "Keepalive hit"
            );
            metrics::record_keepalive(&self.inner.upstream, "hit");
            return Some(conn);
        }

        tracing::debug!(upstream = %self.inner.upstream, addr = %addr, "Keepalive miss");
        metrics::record_keepalive(&self.inner.upstream, "miss");
        None
    }

    /// Hand a connection back after a request. Closed unless `reusable` and
    /// within the pool's limits.
    pub fn release(&self, conn: Connection, reusable: bool) {
        let settings = &self.inner.settings;
        let reason = if !reusable {
            Some("not reusable")
        } else if settings.capacity == 0 {
            Some("keepalive disabled")
        } else if settings.max_requests > 0 && conn.requests() >= settings.max_requests {
            Some("max requests reached")
        } else if conn.age() >= settings.max_lifetime {
            Some("lifetime exceeded")
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::debug!(connection_id = %conn.id(), addr = %conn.addr(), reason, "Closing upstream connection");
            return;
        }

        let mut state = self.inner.lock();
        if state.shutting_down {
            tracing::debug!(connection_id = %conn.id(), "Closing upstream connection, shutting down");
            return;
        }

        if state.cache.len() >= settings.capacity {
            if let Some(oldest) = state.cache.pop_back() {
                metrics::record_keepalive(&self.inner.upstream, "evicted");
                oldest.close("evicted");
            }
        }

        let key = state.next_key;
        state.next_key += 1;
        tracing::debug!(
            upstream = %self.inner.upstream,
            connection_id = %conn.id(),
            addr = %conn.addr(),
            cached = state.cache.len() + 1,
            "Caching upstream connection"
        );
        state.cache.push_front(Cached {
            key,
            conn,
            idle_since: Instant::now(),
            detector: None,
        });
        drop(state);

        let watcher = tokio::spawn(watch_idle(Arc::downgrade(&self.inner), key, settings.idle_timeout));
        let mut state = self.inner.lock();
        match state.cache.iter_mut().find(|c| c.key == key) {
            Some(entry) => entry.detector = Some(watcher.abort_handle()),
            None => watcher.abort(),
        }
    }

    /// Close every cached connection and refuse new ones.
    pub fn shutdown(&self) {
        let drained: Vec<Cached> = {
            let mut state = self.inner.lock();
            state.shutting_down = true;
            state.cache.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.close("shutdown");
        }
        if count > 0 {
            tracing::info!(upstream = %self.inner.upstream, closed = count, "Keepalive pool drained");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}

/// Close detector of one cached connection. Removes the entry when the peer
/// closes it or it stays idle past `idle_timeout`.
async fn watch_idle(pool: Weak<PoolInner>, key: u64, idle_timeout: Duration) {
    let closed = poll_fn(|cx| {
        let Some(pool) = pool.upgrade() else {
            return Poll::Ready(false);
        };
        let mut state = pool.lock();
        match state.cache.iter_mut().find(|c| c.key == key) {
            Some(entry) => entry.conn.poll_closed(cx).map(|()| true),
            None => Poll::Ready(false),
        }
    });

    let reason = match tokio::time::timeout(idle_timeout, closed).await {
        Ok(true) => "closed by peer",
        Ok(false) => return,
        Err(_) => "idle timeout",
    };

    let Some(pool) = pool.upgrade() else {
        return;
    };
    let entry = {
        let mut state = pool.lock();
        let position = state.cache.iter().position(|c| c.key == key);
        position.and_then(|i| state.cache.remove(i))
    };
    if let Some(mut entry) = entry {
        if reason == "closed by peer" {
            metrics::record_keepalive(&pool.upstream, "closed");
        }
        // the detector is this task
        entry.detector = None;
        entry.close(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn settings(capacity: usize) -> KeepaliveSettings {
        KeepaliveSettings {
            capacity,
            idle_timeout: Duration::from_secs(60),
            max_requests: 100,
            max_lifetime: Duration::from_secs(3600),
        }
    }

    fn conn(port: u16) -> (Connection, DuplexStream) {
        let (near, far) = tokio::io::duplex(64);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        (Connection::new(addr, near), far)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn reuse_by_address() {
        let pool = ConnectionPool::new("web", settings(4));
        let (c1, _f1) = conn(8001);
        let (c2, _f2) = conn(8002);
        let id1 = c1.id();
        pool.release(c1, true);
        pool.release(c2, true);

        let got = pool.acquire(addr(8001)).unwrap();
        assert_eq!(got.id(), id1);
        assert!(got.is_reused());
        assert!(pool.acquire(addr(8001)).is_none());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn not_reusable_is_closed() {
        let pool = ConnectionPool::new("web", settings(4));
        let (c1, _f1) = conn(8001);
        pool.release(c1, false);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn lru_eviction() {
        let pool = ConnectionPool::new("web", settings(2));
        let (c1, _f1) = conn(8001);
        let (c2, _f2) = conn(8002);
        let (c3, _f3) = conn(8003);
        pool.release(c1, true);
        pool.release(c2, true);
        pool.release(c3, true);

        assert_eq!(pool.idle_count(), 2);
        assert!(pool.acquire(addr(8001)).is_none());
        assert!(pool.acquire(addr(8003)).is_some());
    }

    #[tokio::test]
    async fn closed_connection_never_handed_out() {
        let pool = ConnectionPool::new("web", settings(4));
        let (c1, far) = conn(8001);
        pool.release(c1, true);

        drop(far);
        // no yield: the detector task has not run, acquire re-checks itself
        assert!(pool.acquire(addr(8001)).is_none());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn detector_removes_closed_entry() {
        let pool = ConnectionPool::new("web", settings(4));
        let (c1, far) = conn(8001);
        pool.release(c1, true);
        tokio::task::yield_now().await;

        drop(far);
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if pool.idle_count() == 0 {
                break;
            }
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_closes() {
        let mut s = settings(4);
        s.idle_timeout = Duration::from_millis(100);
        let pool = ConnectionPool::new("web", s);
        let (c1, _far) = conn(8001);
        pool.release(c1, true);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn request_limit_and_shutdown() {
        let mut s = settings(4);
        s.max_requests = 1;
        let pool = ConnectionPool::new("web", s);
        let (mut c1, _f1) = conn(8001);
        c1.start_request();
        pool.release(c1, true);
        assert_eq!(pool.idle_count(), 0);

        let pool = ConnectionPool::new("web", settings(4));
        let (c2, _f2) = conn(8002);
        pool.release(c2, true);
        pool.shutdown();
        assert_eq!(pool.idle_count(), 0);
        let (c3, _f3) = conn(8003);
        pool.release(c3, true);
        assert_eq!(pool.idle_count(), 0);
    }
}
