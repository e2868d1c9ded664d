use axum::{extract::State, Json};
use serde::Serialize;

use crate::http::AppState;
use crate::upstream::registry::UpstreamSnapshot;
use crate::upstream::SessionReport;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub active_connections: u64,
    pub upstreams: Vec<String>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.uptime().as_secs(),
        active_connections: state.tracker().active_count(),
        upstreams: state.registry().names(),
    })
}

/// Per-peer counters and derived health of every upstream.
pub async fn get_upstreams(State(state): State<AppState>) -> Json<Vec<UpstreamSnapshot>> {
    Json(state.registry().snapshot())
}

/// Outcome logs of the latest sessions, newest first.
pub async fn get_sessions(State(state): State<AppState>) -> Json<Vec<SessionReport>> {
    Json(state.recent_sessions())
}
