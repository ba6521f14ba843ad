//! Axum handlers for the host's built-in endpoints and request dispatch.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and assembles the router: the built-in endpoints are axum
//! routes, every other path falls through to [`dispatch_handler`].

pub mod dispatch;
pub mod docs;
pub mod health;

pub use dispatch::dispatch_handler;
pub use docs::routes_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;

use super::middleware::build_http_layers;
use super::{HostConfig, ShutdownController};
use crate::service::{RequestGovernor, RouteRegistry};
use crate::storage::TransactionManager;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<ShutdownController>,
    /// Frozen at start; never mutated while serving.
    pub registry: Arc<RouteRegistry>,
    pub governor: RequestGovernor,
    pub transactions: Arc<TransactionManager>,
    pub config: Arc<HostConfig>,
    /// Highest applied migration version at start.
    pub schema_version: Option<u64>,
    /// Used for uptime calculation.
    pub start_time: Instant,
}

/// Assembles the axum router with the built-in routes and middleware.
///
/// Routes:
/// - `GET /health` -- detailed health JSON
/// - `GET /health/live` -- liveness probe
/// - `GET /health/ready` -- readiness probe
/// - `GET /docs/routes` -- route listing, only with `expose_docs`
/// - anything else -- registry resolution and the request governor
pub fn build_router(state: AppState) -> Router {
    let layers = build_http_layers(&state.config);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler));
    if state.config.expose_docs {
        router = router.route("/docs/routes", get(routes_handler));
    }

    router
        .fallback(dispatch_handler)
        .layer(layers)
        .with_state(state)
}
