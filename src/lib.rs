//! Upstream proxying engine.
//!
//! Passes client requests to groups of backend peers: peer selection with
//! passive health accounting, connection reuse, failover across peers and
//! streaming or buffered response relay. A minimal HTTP/1.1 front-end and an
//! admin API make it runnable as a proxy.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use http::{AppState, HttpServer};
pub use lifecycle::Shutdown;
pub use upstream::{SessionReport, UpstreamError, UpstreamRegistry, UpstreamSession};
