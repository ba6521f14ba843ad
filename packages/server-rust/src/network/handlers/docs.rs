//! Route listing for the documentation endpoint.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::service::RouteInfo;

/// Lists every registered route, sorted by pattern then method.
pub async fn routes_handler(State(state): State<AppState>) -> Json<Vec<RouteInfo>> {
    Json(state.registry.routes())
}
