//! Admin API.
//!
//! # Endpoints
//! - `GET /admin/status`: version, uptime, open connections
//! - `GET /admin/upstreams`: per-peer weights, failures, connections, health
//! - `GET /admin/sessions`: outcome logs of recent sessions
//!
//! Every endpoint requires the configured bearer key.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/upstreams", get(get_upstreams))
        .route("/admin/sessions", get(get_sessions))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
