//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerDeps;
use crate::server::routes::{approvals, audit, health_handler, jobs, stream, webhooks};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
}

/// Build the application router.
pub fn build_app(deps: Arc<ServerDeps>) -> Router {
    let state = AppState { deps };

    Router::new()
        // Health
        .route("/health", get(health_handler))
        // Internal control API (the surface the UI depends on)
        .route("/jobs", post(jobs::enqueue_handler))
        .route("/jobs/:id", get(jobs::get_handler))
        .route("/jobs/:id/retry", post(jobs::retry_handler))
        .route("/jobs/:id/cancel", post(jobs::cancel_handler))
        .route("/approvals", get(approvals::list_handler))
        .route("/approvals/:id/decide", post(approvals::decide_handler))
        .route("/audit", get(audit::list_handler))
        // Platform webhook intake
        .route("/webhooks/:platform/:store_id", post(webhooks::intake_handler))
        // Per-tenant change notification stream
        .route("/streams/:tenant_id", get(stream::stream_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
}
