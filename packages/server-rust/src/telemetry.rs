//! Request telemetry sinks and process-level observability setup.
//!
//! The governor reports one [`RequestSample`] per request to an injected
//! [`TelemetrySink`]; nothing here is a global the library installs on its
//! own. The binary calls [`init_tracing`] and, optionally,
//! [`install_prometheus`] so that [`MetricsSink`] output is scraped.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use dashmap::DashMap;
use http::Method;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::service::request::{DispatchError, HandlerError, HostResponse};

/// Route label for requests that never matched a registered pattern.
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    HandlerError,
    TimedOut,
    Rejected,
    NotFound,
    Unavailable,
    Internal,
    /// The request future was dropped before it finished.
    Abandoned,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HandlerError => "handler_error",
            Self::TimedOut => "timed_out",
            Self::Rejected => "rejected",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn of(result: &Result<HostResponse, DispatchError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(DispatchError::Rejected) => Self::Rejected,
            Err(DispatchError::TimedOut { .. } | DispatchError::Handler(HandlerError::Cancelled)) => {
                Self::TimedOut
            }
            Err(DispatchError::NotFound { .. }) => Self::NotFound,
            Err(DispatchError::Unavailable) => Self::Unavailable,
            Err(DispatchError::Handler(_)) => Self::HandlerError,
            Err(DispatchError::Internal(_)) => Self::Internal,
        }
    }
}

/// One request's measurement.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub method: Method,
    /// Matched pattern, or [`UNMATCHED_ROUTE`].
    pub route: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Destination for request measurements.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, sample: &RequestSample);
}

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

/// Default sink: emits `metrics` counters and histograms plus a debug event.
///
/// Series:
/// - `harbor_requests_total{method, route, outcome}`
/// - `harbor_request_duration_seconds{method, route, outcome}`
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl TelemetrySink for MetricsSink {
    fn record(&self, sample: &RequestSample) {
        let method = sample.method.to_string();
        let outcome = sample.outcome.as_str();
        metrics::counter!(
            "harbor_requests_total",
            "method" => method.clone(),
            "route" => sample.route.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(
            "harbor_request_duration_seconds",
            "method" => method.clone(),
            "route" => sample.route.clone(),
            "outcome" => outcome
        )
        .record(sample.duration.as_secs_f64());

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = sample.duration.as_millis() as u64;
        debug!(
            method = %method,
            route = %sample.route,
            outcome,
            duration_ms,
            "request complete"
        );
    }
}

// ---------------------------------------------------------------------------
// CollectingSink
// ---------------------------------------------------------------------------

/// Per-route aggregate kept by [`CollectingSink`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub count: u64,
    pub failures: u64,
    pub max_duration_ms: u64,
}

/// In-process sink that keeps every sample and a per-route summary.
///
/// Useful for tests and for embedding processes that want to inspect traffic
/// without a metrics backend.
#[derive(Debug, Default)]
pub struct CollectingSink {
    samples: Mutex<Vec<RequestSample>>,
    per_route: DashMap<String, RouteSummary>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn samples(&self) -> Vec<RequestSample> {
        self.samples.lock().clone()
    }

    /// Number of samples with the given outcome.
    #[must_use]
    pub fn count(&self, outcome: Outcome) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.outcome == outcome)
            .count()
    }

    #[must_use]
    pub fn route_summary(&self, route: &str) -> Option<RouteSummary> {
        self.per_route.get(route).map(|entry| entry.value().clone())
    }
}

impl TelemetrySink for CollectingSink {
    fn record(&self, sample: &RequestSample) {
        self.samples.lock().push(sample.clone());

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = sample.duration.as_millis() as u64;
        let mut summary = self.per_route.entry(sample.route.clone()).or_default();
        summary.count += 1;
        if sample.outcome != Outcome::Success {
            summary.failures += 1;
        }
        summary.max_duration_ms = summary.max_duration_ms.max(duration_ms);
    }
}

// ---------------------------------------------------------------------------
// Process setup
// ---------------------------------------------------------------------------

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. With `json` set,
/// events are written as one JSON object per line.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("installing JSON tracing subscriber")?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("installing tracing subscriber")?;
    }
    Ok(())
}

/// Installs the Prometheus recorder with a scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Fails if a recorder is already installed or the listener cannot bind.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing Prometheus exporter on {addr}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    fn sample(route: &str, outcome: Outcome, ms: u64) -> RequestSample {
        RequestSample {
            method: Method::GET,
            route: route.to_string(),
            outcome,
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn outcome_classifies_results() {
        assert_eq!(
            Outcome::of(&Ok(HostResponse::new(StatusCode::OK))),
            Outcome::Success
        );
        assert_eq!(
            Outcome::of(&Err(DispatchError::TimedOut { timeout_ms: 5 })),
            Outcome::TimedOut
        );
        assert_eq!(
            Outcome::of(&Err(DispatchError::Handler(HandlerError::BadRequest(
                "x".into()
            )))),
            Outcome::HandlerError
        );
        assert_eq!(Outcome::of(&Err(DispatchError::Rejected)), Outcome::Rejected);
    }

    #[test]
    fn collecting_sink_aggregates_per_route() {
        let sink = CollectingSink::new();
        sink.record(&sample("/a", Outcome::Success, 5));
        sink.record(&sample("/a", Outcome::TimedOut, 50));
        sink.record(&sample("/b", Outcome::Success, 1));

        assert_eq!(sink.samples().len(), 3);
        assert_eq!(sink.count(Outcome::TimedOut), 1);
        assert_eq!(
            sink.route_summary("/a"),
            Some(RouteSummary {
                count: 2,
                failures: 1,
                max_duration_ms: 50,
            })
        );
        assert!(sink.route_summary("/c").is_none());
    }

    #[test]
    fn metrics_sink_records_without_a_recorder() {
        // With no recorder installed the metrics macros are no-ops.
        MetricsSink.record(&sample("/a", Outcome::Success, 1));
    }
}
