//! Fallback handler: every non-built-in request is resolved against the
//! route registry and run through the request governor.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::AppState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::network::HostState;
use crate::service::{DispatchError, HandlerError, HostRequest};
use crate::telemetry::Outcome;

pub async fn dispatch_handler(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let method = request.method().clone();

    if state.lifecycle.state() != HostState::Started {
        state
            .governor
            .record_unrouted(method, Outcome::Unavailable, started.elapsed());
        return DispatchError::Unavailable.into_response();
    }
    let _in_flight = state.lifecycle.in_flight_guard();

    let host_request = match into_host_request(request, state.config.max_body_bytes).await {
        Ok(req) => req,
        Err(e) => {
            state
                .governor
                .record_unrouted(method, Outcome::HandlerError, started.elapsed());
            return DispatchError::from(e).into_response();
        }
    };

    let route = match state.registry.resolve(&host_request.method, &host_request.path) {
        Ok(route) => route,
        Err(_) => {
            debug!(method = %method, path = %host_request.path, "no route");
            state
                .governor
                .record_unrouted(method.clone(), Outcome::NotFound, started.elapsed());
            return DispatchError::NotFound {
                method,
                path: host_request.path,
            }
            .into_response();
        }
    };

    let abandon = state.lifecycle.abandon_token();
    let result = tokio::select! {
        result = state.governor.dispatch(host_request, route) => result,
        () = abandon.cancelled() => {
            warn!(method = %method, "request abandoned at shutdown");
            Err(DispatchError::Unavailable)
        }
    };
    match result {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn into_host_request(request: Request, limit: usize) -> Result<HostRequest, HandlerError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| HandlerError::BadRequest(format!("unreadable body: {e}")))?;

    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    Ok(HostRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        request_id,
    })
}
