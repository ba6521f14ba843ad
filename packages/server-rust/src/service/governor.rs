//! The request governor: admission, timeout and instrumentation around
//! handler invocation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Method;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use super::handler::HandlerContext;
use super::middleware::{build_governor_pipeline, AdmissionControl, DetachedTasks, GovernorStack};
use super::request::{DispatchError, HostRequest, HostResponse};
use super::router::ResolvedRoute;
use crate::storage::TransactionManager;
use crate::telemetry::{Outcome, RequestSample, TelemetrySink, UNMATCHED_ROUTE};

/// A resolved request travelling through the governor stack.
pub struct Invocation {
    pub request: HostRequest,
    pub route: ResolvedRoute,
    /// Fired when the request times out.
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// HandlerInvoker
// ---------------------------------------------------------------------------

/// Innermost service: builds the [`HandlerContext`] and calls the handler.
#[derive(Clone)]
pub struct HandlerInvoker {
    transactions: Option<Arc<TransactionManager>>,
    budget: Duration,
}

impl HandlerInvoker {
    #[must_use]
    pub fn new(transactions: Option<Arc<TransactionManager>>, budget: Duration) -> Self {
        Self {
            transactions,
            budget,
        }
    }
}

impl Service<Invocation> for HandlerInvoker {
    type Response = HostResponse;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<HostResponse, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let ctx = HandlerContext {
            params: inv.route.params,
            pattern: inv.route.pattern,
            request_id: inv.request.request_id.clone(),
            cancel: inv.cancel,
            deadline: Instant::now() + self.budget,
            transactions: self.transactions.clone(),
        };
        let handler = inv.route.handler;
        let request = inv.request;
        Box::pin(async move { handler.handle(request, ctx).await.map_err(DispatchError::from) })
    }
}

// ---------------------------------------------------------------------------
// RequestGovernor
// ---------------------------------------------------------------------------

/// Limits for a [`RequestGovernor`].
#[derive(Debug, Clone, Copy)]
pub struct GovernorConfig {
    pub max_concurrency: usize,
    pub request_timeout: Duration,
}

/// Runs resolved requests through admission, timeout and instrumentation.
///
/// Cheap to clone; clones share the concurrency budget and counters.
#[derive(Clone)]
pub struct RequestGovernor {
    stack: GovernorStack,
    admission: Arc<AdmissionControl>,
    detached: Arc<DetachedTasks>,
    sink: Arc<dyn TelemetrySink>,
    config: GovernorConfig,
}

impl RequestGovernor {
    #[must_use]
    pub fn new(
        config: GovernorConfig,
        sink: Arc<dyn TelemetrySink>,
        transactions: Option<Arc<TransactionManager>>,
    ) -> Self {
        let admission = Arc::new(AdmissionControl::new(config.max_concurrency));
        let detached = Arc::new(DetachedTasks::default());
        let stack = build_governor_pipeline(
            HandlerInvoker::new(transactions, config.request_timeout),
            Arc::clone(&sink),
            Arc::clone(&admission),
            config.request_timeout,
            Arc::clone(&detached),
        );
        Self {
            stack,
            admission,
            detached,
            sink,
            config,
        }
    }

    /// Runs `route`'s handler for `request` under the governor.
    ///
    /// # Errors
    ///
    /// `Rejected`, `TimedOut`, the handler's own error, or `Internal` if the
    /// handler panicked.
    pub async fn dispatch(
        &self,
        request: HostRequest,
        route: ResolvedRoute,
    ) -> Result<HostResponse, DispatchError> {
        let inv = Invocation {
            request,
            route,
            cancel: CancellationToken::new(),
        };
        self.stack.clone().oneshot(inv).await
    }

    /// Reports a request that ended before reaching the governor (no route,
    /// host draining) so it still shows up in telemetry.
    pub fn record_unrouted(&self, method: Method, outcome: Outcome, duration: Duration) {
        self.sink.record(&RequestSample {
            method,
            route: UNMATCHED_ROUTE.to_string(),
            outcome,
            duration,
        });
    }

    #[must_use]
    pub fn config(&self) -> GovernorConfig {
        self.config
    }

    /// Admission tickets currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.admission.peak_in_flight()
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.admission.rejected()
    }

    /// Handlers still running after their request ended.
    #[must_use]
    pub fn detached(&self) -> usize {
        self.detached.active()
    }

    /// Requests that hit the deadline.
    #[must_use]
    pub fn timed_out(&self) -> u64 {
        self.detached.timed_out()
    }

    /// Requests dropped before their handler finished, such as those
    /// abandoned at shutdown or whose client went away.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.detached.dropped()
    }

    /// Waits until no admission ticket is held, up to `timeout`.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.admission.wait_for_idle(timeout).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
