//! Request, response and error types that flow through the dispatch pipeline.

use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::StoreError;

// ---------------------------------------------------------------------------
// HostRequest
// ---------------------------------------------------------------------------

/// An inbound request as seen by route handlers.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Value of the `x-request-id` header assigned by the transport layer.
    pub request_id: String,
}

impl HostRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// [`HandlerError::BadRequest`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| HandlerError::BadRequest(format!("invalid JSON body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// HostResponse
// ---------------------------------------------------------------------------

/// A handler's response.
#[derive(Debug, Clone)]
pub struct HostResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HostResponse {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT)
    }

    #[must_use]
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
            .with_body(body)
    }

    /// Serializes `value` as a JSON body.
    ///
    /// # Errors
    ///
    /// Fails only if `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<Self, HandlerError> {
        let body = serde_json::to_vec(value).map_err(|e| HandlerError::Other(e.into()))?;
        Ok(Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body))
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

impl IntoResponse for HostResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The handler noticed its request was cancelled and gave up.
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a request did not produce a handler response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("server at capacity, try again later")]
    Rejected,
    #[error("request timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    #[error("no route for {method} {path}")]
    NotFound { method: Method, path: String },
    #[error("server is shutting down")]
    Unavailable,
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable kind, used as the `error` field of the body.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::TimedOut { .. } => "timed_out",
            Self::NotFound { .. } | Self::Handler(HandlerError::NotFound(_)) => "not_found",
            Self::Unavailable => "unavailable",
            Self::Handler(HandlerError::BadRequest(_)) => "bad_request",
            Self::Handler(HandlerError::Cancelled) => "cancelled",
            Self::Handler(HandlerError::Store(e)) if e.is_conflict() => "conflict",
            Self::Handler(HandlerError::Store(StoreError::PoolExhausted { .. })) => {
                "pool_exhausted"
            }
            Self::Handler(_) | Self::Internal(_) => "internal",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.kind() {
            "rejected" | "unavailable" | "pool_exhausted" => StatusCode::SERVICE_UNAVAILABLE,
            "timed_out" | "cancelled" => StatusCode::GATEWAY_TIMEOUT,
            "not_found" => StatusCode::NOT_FOUND,
            "bad_request" => StatusCode::BAD_REQUEST,
            "conflict" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
