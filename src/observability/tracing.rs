//! Session spans.
//!
//! # Responsibilities
//! - Create one span per upstream session carrying the session ID
//! - Let every attempt, pool and relay event inherit that ID
//!
//! # Design Decisions
//! - The downstream `x-request-id` is reused as the session ID when valid

use http::HeaderMap;
use tracing::Span;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Session ID taken from `x-request-id`, or a fresh v4 UUID.
pub fn session_id(headers: &HeaderMap) -> Uuid {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

pub fn session_span(id: Uuid, upstream: &str, method: &http::Method, uri: &http::Uri) -> Span {
    tracing::info_span!("upstream_session", session_id = %id, upstream = %upstream, method = %method, uri = %uri)
}
