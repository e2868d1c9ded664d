//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define upstream engine metrics (attempts, sessions, keepalive, spill)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-peer and aggregate metrics
//!
//! # Metrics
//! - `upstream_attempts_total` (counter): attempts by upstream, peer, outcome
//! - `upstream_sessions_total` (counter): finished sessions by upstream, status
//! - `upstream_session_duration_seconds` (histogram): session latency
//! - `upstream_keepalive_total` (counter): pool hit, miss, closed, evicted
//! - `upstream_relay_spilled_bytes_total` (counter): bytes written to temp files
//! - `upstream_peer_available` (gauge): 1=selectable, 0=failed or down
//! - `proxy_active_connections` (gauge): current downstream connection count
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op
//! - Labels for upstream, peer, status code

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const UPSTREAM_ATTEMPTS_TOTAL: &str = "upstream_attempts_total";
pub const UPSTREAM_SESSIONS_TOTAL: &str = "upstream_sessions_total";
pub const UPSTREAM_SESSION_DURATION_SECONDS: &str = "upstream_session_duration_seconds";
pub const UPSTREAM_KEEPALIVE_TOTAL: &str = "upstream_keepalive_total";
pub const UPSTREAM_RELAY_SPILLED_BYTES_TOTAL: &str = "upstream_relay_spilled_bytes_total";
pub const UPSTREAM_PEER_AVAILABLE: &str = "upstream_peer_available";
pub const PROXY_ACTIVE_CONNECTIONS: &str = "proxy_active_connections";

static DESCRIBE: Once = Once::new();

fn describe() {
    DESCRIBE.call_once(|| {
        describe_counter!(UPSTREAM_ATTEMPTS_TOTAL, Unit::Count, "Attempts made against upstream peers.");
        describe_counter!(UPSTREAM_SESSIONS_TOTAL, Unit::Count, "Finished upstream sessions.");
        describe_histogram!(
            UPSTREAM_SESSION_DURATION_SECONDS,
            Unit::Seconds,
            "Time from session start to finalization."
        );
        describe_counter!(UPSTREAM_KEEPALIVE_TOTAL, Unit::Count, "Keepalive pool lookups and evictions.");
        describe_counter!(
            UPSTREAM_RELAY_SPILLED_BYTES_TOTAL,
            Unit::Bytes,
            "Response bytes written to temporary files."
        );
        describe_gauge!(UPSTREAM_PEER_AVAILABLE, "Whether a peer is selectable (1) or not (0).");
        describe_gauge!(PROXY_ACTIVE_CONNECTIONS, "Number of open downstream connections.");
    });
}

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_attempt(upstream: &str, peer: &str, outcome: &'static str) {
    counter!(
        UPSTREAM_ATTEMPTS_TOTAL,
        "upstream" => upstream.to_string(),
        "peer" => peer.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_session(upstream: &str, status: u16, duration: Duration) {
    counter!(
        UPSTREAM_SESSIONS_TOTAL,
        "upstream" => upstream.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(UPSTREAM_SESSION_DURATION_SECONDS, "upstream" => upstream.to_string())
        .record(duration.as_secs_f64());
}

/// `result` is one of hit, miss, closed or evicted.
pub fn record_keepalive(upstream: &str, result: &'static str) {
    counter!(
        UPSTREAM_KEEPALIVE_TOTAL,
        "upstream" => upstream.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_spilled(bytes: u64) {
    counter!(UPSTREAM_RELAY_SPILLED_BYTES_TOTAL).increment(bytes);
}

pub fn set_peer_available(upstream: &str, peer: &str, available: bool) {
    gauge!(
        UPSTREAM_PEER_AVAILABLE,
        "upstream" => upstream.to_string(),
        "peer" => peer.to_string()
    )
    .set(if available { 1.0 } else { 0.0 });
}

pub fn set_active_connections(count: usize) {
    gauge!(PROXY_ACTIVE_CONNECTIONS).set(count as f64);
}
