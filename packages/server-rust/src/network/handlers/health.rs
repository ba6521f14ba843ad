//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose host health for orchestrators (Kubernetes, load
//! balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HostState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the body says whether the host
/// is actually serving.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let governor = &state.governor;

    Json(json!({
        "state": state.lifecycle.state().as_str(),
        "in_flight": governor.in_flight(),
        "peak_in_flight": governor.peak_in_flight(),
        "detached": governor.detached(),
        "rejected": governor.rejected(),
        "timed_out": governor.timed_out(),
        "dropped": governor.dropped(),
        "max_concurrency": governor.config().max_concurrency,
        "pool": state.transactions.pool().stats(),
        "transactions": state.transactions.stats(),
        "schema_version": state.schema_version,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe -- always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe -- 200 only while the host is `Started`.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.state() == HostState::Started {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::test_support;

    #[tokio::test]
    async fn health_handler_returns_json_with_all_fields() {
        let state = test_support::state();

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["state"], "started");
        assert_eq!(json["in_flight"], 0);
        assert_eq!(json["max_concurrency"], 64);
        assert_eq!(json["pool"]["max_size"], 8);
        assert!(json["schema_version"].is_null());
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_draining_state() {
        let state = test_support::state();
        state.lifecycle.trigger_shutdown();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "draining");
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_lifecycle() {
        let state = test_support::state();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.lifecycle.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
