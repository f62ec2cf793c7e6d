use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::get;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;
use crate::handlers;
use crate::registry::SessionRegistry;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub registry: SessionRegistry,
}

/// Limits applied around the gateway.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    pub max_connections: usize,
    pub max_body_bytes: usize,
    /// Bound on reading a request and producing response headers. Open
    /// WebSocket and SSE streams are not affected.
    pub request_timeout: Duration,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, limits: &ServerLimits) -> Router {
    // Probes are matched first; every other path goes through the gateway.
    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .fallback(handlers::dispatch)
        .with_state(state)
        .layer(DefaultBodyLimit::max(limits.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            limits.request_timeout,
        ))
        .layer(ConcurrencyLimitLayer::new(limits.max_connections))
        .layer(TraceLayer::new_for_http())
}
