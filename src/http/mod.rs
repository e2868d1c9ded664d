//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept, connection tracking)
//!     → request.rs (read head and body, enforce limits)
//!     → routing (host + path prefix → upstream name)
//!     → upstream.rs (HTTP/1.1 protocol driving an UpstreamSession)
//!     → relayed response, or response.rs error when nothing was relayed
//! ```

pub mod request;
pub mod response;
pub mod server;
pub mod upstream;

pub use request::{read_request, DownstreamRequest, RequestError, RequestLimits};
pub use server::{AppState, HttpServer};
pub use upstream::Http1Protocol;
