//! The route handler seam and the per-request context handed to it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::request::{HandlerError, HostRequest, HostResponse};
use super::router::PathParams;
use crate::storage::{Transaction, TransactionManager};

/// An opaque unit of work bound to a route.
///
/// Implemented for any `Fn(HostRequest, HandlerContext) -> impl Future` that
/// is `Send + Sync + 'static`, so plain async closures and functions can be
/// registered directly.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: HostRequest,
        ctx: HandlerContext,
    ) -> Result<HostResponse, HandlerError>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(HostRequest, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HostResponse, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        request: HostRequest,
        ctx: HandlerContext,
    ) -> Result<HostResponse, HandlerError> {
        (self)(request, ctx).await
    }
}

/// A handler shared between the registry and running requests.
pub type SharedHandler = Arc<dyn RouteHandler>;

/// Everything a handler knows about the request beyond its payload.
#[derive(Clone)]
pub struct HandlerContext {
    pub(crate) params: PathParams,
    pub(crate) pattern: Arc<str>,
    pub(crate) request_id: String,
    pub(crate) cancel: CancellationToken,
    pub(crate) deadline: Instant,
    pub(crate) transactions: Option<Arc<TransactionManager>>,
}

impl HandlerContext {
    /// Builds a context outside the dispatch pipeline, e.g. to call a handler
    /// directly in a test.
    #[must_use]
    pub fn detached(params: PathParams, budget: Duration) -> Self {
        Self {
            params,
            pattern: Arc::from(""),
            request_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            deadline: Instant::now() + budget,
            transactions: None,
        }
    }

    #[must_use]
    pub fn with_transactions(mut self, transactions: Arc<TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Captured value of the `{name}` segment.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    #[must_use]
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// The registered pattern this request matched, e.g. `/notes/{id}`.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Cancelled when the request times out. Long-running handlers should
    /// select on it and stop early.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the request times out.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn transactions(&self) -> Option<&Arc<TransactionManager>> {
        self.transactions.as_ref()
    }

    /// Opens a transaction tied to this request's cancellation.
    ///
    /// # Errors
    ///
    /// Storage errors from `begin`, or [`HandlerError::Other`] if the host has
    /// no storage configured.
    pub async fn begin(&self) -> Result<Transaction, HandlerError> {
        let Some(tm) = &self.transactions else {
            return Err(HandlerError::Other(anyhow!("no storage configured for this host")));
        };
        Ok(tm.begin_for_request(self.cancel.clone()).await?)
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .field("request_id", &self.request_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
