//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Downstream listener configuration.
    pub listener: ListenerConfig,

    /// Route definitions mapping requests to upstreams.
    pub routes: Vec<RouteConfig>,

    /// Upstream groups.
    pub upstreams: Vec<UpstreamConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent downstream connections (backpressure).
    pub max_connections: usize,

    /// Largest accepted request head, in bytes.
    pub max_request_header_size: usize,

    /// Largest accepted request body, in bytes.
    pub max_request_body_size: usize,

    /// Time allowed for in-flight requests to finish on shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_request_header_size: 8 * 1024,
            max_request_body_size: 2 * 1024 * 1024,
            drain_timeout_ms: 10_000,
        }
    }
}

/// Route configuration mapping requests to an upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Upstream name to forward to.
    pub upstream: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Load balancing algorithm for an upstream.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMethod {
    /// Smooth weighted round-robin.
    #[default]
    RoundRobin,
    /// Weighted least connections.
    LeastConn,
}

/// An upstream group: peers plus every policy the engine consumes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream name referenced by routes.
    pub name: String,

    /// Load balancing algorithm.
    #[serde(default)]
    pub balance: BalanceMethod,

    /// Backend servers.
    pub servers: Vec<ServerConfig>,

    /// Per-phase timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Failover policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Response buffering.
    #[serde(default)]
    pub buffering: BufferingConfig,

    /// Idle connection cache.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Optional TLS towards the backends.
    #[serde(default)]
    pub tls: Option<UpstreamTlsConfig>,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Backend address (e.g., "127.0.0.1:3000" or "backend.internal:80").
    pub address: String,

    /// Weight for weighted load balancing.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Failures within `fail_timeout_ms` before the peer is disabled (0 = never).
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Failure accounting window and disable duration, in milliseconds.
    #[serde(default = "default_fail_timeout_ms")]
    pub fail_timeout_ms: u64,

    /// Maximum concurrent connections to this peer (0 = unlimited).
    #[serde(default)]
    pub max_conns: usize,

    /// Permanently excluded from selection.
    #[serde(default)]
    pub down: bool,

    /// Only used when every primary peer is unavailable.
    #[serde(default)]
    pub backup: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout_ms() -> u64 {
    10_000
}

impl ServerConfig {
    /// A server with default policy, mostly useful in tests.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: default_weight(),
            max_fails: default_max_fails(),
            fail_timeout_ms: default_fail_timeout_ms(),
            max_conns: 0,
            down: false,
            backup: false,
        }
    }

    /// Set the weight.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn fail_timeout(&self) -> Duration {
        Duration::from_millis(self.fail_timeout_ms)
    }
}

/// Timeout configuration for the phases of an attempt.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment (including TLS) timeout.
    pub connect_ms: u64,

    /// Maximum pause between two successful writes of the request.
    pub send_ms: u64,

    /// Maximum pause between two successful reads of the response.
    pub read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 60_000,
            send_ms: 60_000,
            read_ms: 60_000,
        }
    }
}

/// Conditions under which a request is passed to the next peer.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    Error,
    Timeout,
    InvalidHeader,
    #[serde(rename = "http_500")]
    Http500,
    #[serde(rename = "http_502")]
    Http502,
    #[serde(rename = "http_503")]
    Http503,
    #[serde(rename = "http_504")]
    Http504,
    #[serde(rename = "http_403")]
    Http403,
    #[serde(rename = "http_404")]
    Http404,
    #[serde(rename = "http_429")]
    Http429,
    NonIdempotent,
    Off,
}

/// Failover configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Conditions that allow trying the next peer.
    pub retry_on: Vec<RetryCondition>,

    /// Maximum number of attempts (0 = one per configured peer).
    pub tries: u32,

    /// Time budget for passing a request to the next peer (0 = unlimited).
    pub timeout_ms: u64,

    /// Exclude peers already attempted by the same request.
    pub exclude_tried: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on: vec![RetryCondition::Error, RetryCondition::Timeout],
            tries: 0,
            timeout_ms: 0,
            exclude_tried: false,
        }
    }
}

/// Response buffering configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Buffered relay when true, streaming relay when false.
    pub enabled: bool,

    /// Size of one relay buffer.
    pub buffer_size: usize,

    /// Number of in-memory buffers before spilling to a temporary file.
    pub buffers: usize,

    /// Largest accepted response header.
    pub header_buffer_size: usize,

    /// Upper bound of the temporary file (0 disables spilling).
    pub max_temp_file_size: u64,

    /// Directory for temporary files (system default when unset).
    pub temp_path: Option<PathBuf>,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 8 * 1024,
            buffers: 8,
            header_buffer_size: 8 * 1024,
            max_temp_file_size: 1024 * 1024 * 1024,
            temp_path: None,
        }
    }
}

impl BufferingConfig {
    /// In-memory bytes allowed before spilling.
    pub fn spill_threshold(&self) -> usize {
        self.buffers.saturating_mul(self.buffer_size)
    }
}

/// Keepalive cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Cached idle connections per upstream (0 disables reuse).
    pub capacity: usize,

    /// Idle time after which a cached connection is closed.
    pub idle_timeout_ms: u64,

    /// Requests served by one connection before it is retired.
    pub max_requests: u32,

    /// Age after which a connection is retired.
    pub max_lifetime_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            idle_timeout_ms: 60_000,
            max_requests: 1000,
            max_lifetime_ms: 3_600_000,
        }
    }
}

/// TLS towards the backends.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamTlsConfig {
    /// Name verified against the peer certificate (defaults to the server host).
    pub server_name: Option<String>,

    /// PEM bundle of trusted roots (native roots when unset).
    pub ca_file: Option<PathBuf>,

    /// Resumption tickets kept per peer.
    pub session_cache_size: usize,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
