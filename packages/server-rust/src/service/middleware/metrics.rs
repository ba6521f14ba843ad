//! Instrumentation middleware for requests.
//!
//! Outermost layer of the governor: every request that reaches dispatch is
//! measured here and reported to the host's [`TelemetrySink`]. That includes
//! requests rejected by admission, cut off by the timeout, or dropped before
//! they finished.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::Method;
use tower::{Layer, Service};
use tracing::{debug, info_span, warn, Instrument};

use crate::service::governor::Invocation;
use crate::service::request::{DispatchError, HostResponse};
use crate::telemetry::{Outcome, RequestSample, TelemetrySink};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that times requests and reports them to a sink.
#[derive(Clone)]
pub struct MetricsLayer {
    sink: Arc<dyn TelemetrySink>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            sink: Arc::clone(&self.sink),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records duration and outcome of every request.
#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    sink: Arc<dyn TelemetrySink>,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = HostResponse, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = HostResponse;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<HostResponse, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let mut sample = PendingSample {
            sink: Arc::clone(&self.sink),
            method: inv.request.method.clone(),
            route: inv.route.pattern.to_string(),
            start: Instant::now(),
            recorded: false,
        };

        let span = info_span!(
            "dispatch",
            method = %sample.method,
            route = %sample.route,
            request_id = %inv.request.request_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(inv);

        Box::pin(
            async move {
                let result = fut.await;
                let outcome = Outcome::of(&result);
                let duration = sample.record(outcome);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = duration.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome.as_str());

                if matches!(outcome, Outcome::TimedOut | Outcome::Internal) {
                    warn!(duration_ms, outcome = outcome.as_str(), "request failed");
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Sample for one request, reported exactly once. A request future dropped
/// before it finished (shutdown abandonment, client disconnect) is reported
/// as [`Outcome::Abandoned`].
struct PendingSample {
    sink: Arc<dyn TelemetrySink>,
    method: Method,
    route: String,
    start: Instant,
    recorded: bool,
}

impl PendingSample {
    fn record(&mut self, outcome: Outcome) -> Duration {
        self.recorded = true;
        let duration = self.start.elapsed();
        self.sink.record(&RequestSample {
            method: self.method.clone(),
            route: self.route.clone(),
            outcome,
            duration,
        });
        duration
    }
}

impl Drop for PendingSample {
    fn drop(&mut self) {
        if !self.recorded {
            debug!(route = %self.route, "request dropped before completing");
            self.record(Outcome::Abandoned);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::service::governor::tests::invocation;
    use crate::telemetry::CollectingSink;

    /// Answers with a fixed result.
    #[derive(Clone)]
    struct FixedService {
        fail: bool,
    }

    impl Service<Invocation> for FixedService {
        type Response = HostResponse;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<HostResponse, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _inv: Invocation) -> Self::Future {
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(DispatchError::Rejected)
                } else {
                    Ok(HostResponse::new(StatusCode::OK))
                }
            })
        }
    }

    /// Never answers.
    struct HangingService;

    impl Service<Invocation> for HangingService {
        type Response = HostResponse;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<HostResponse, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _inv: Invocation) -> Self::Future {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn records_success_and_failure() {
        let sink = Arc::new(CollectingSink::new());
        let layer = MetricsLayer::new(Arc::clone(&sink) as Arc<dyn TelemetrySink>);

        let ok = layer.layer(FixedService { fail: false });
        assert!(ok.oneshot(invocation("/a")).await.is_ok());
        let bad = layer.layer(FixedService { fail: true });
        assert!(bad.oneshot(invocation("/a")).await.is_err());

        let samples = sink.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].outcome, Outcome::Success);
        assert_eq!(samples[1].outcome, Outcome::Rejected);
        assert_eq!(samples[0].route, "/a");
        assert_eq!(sink.route_summary("/a").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn dropped_request_is_recorded_as_abandoned() {
        let sink = Arc::new(CollectingSink::new());
        let mut svc = MetricsLayer::new(Arc::clone(&sink) as Arc<dyn TelemetrySink>)
            .layer(HangingService);

        let fut = svc.call(invocation("/hang"));
        assert!(tokio::time::timeout(Duration::from_millis(20), fut)
            .await
            .is_err());

        let samples = sink.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].outcome, Outcome::Abandoned);
        assert_eq!(samples[0].route, "/hang");
        assert!(samples[0].duration >= Duration::from_millis(20));
    }
}
