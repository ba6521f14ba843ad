//! Pipeline composition: combines the governor layers into one service stack.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::admission::{AdmissionControl, AdmissionLayer, AdmissionService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{DetachedTasks, TimeoutLayer, TimeoutService};
use crate::service::governor::HandlerInvoker;
use crate::telemetry::TelemetrySink;

/// The composed governor stack.
pub type GovernorStack = MetricsService<AdmissionService<TimeoutService<HandlerInvoker>>>;

/// Wraps the handler invoker with the governor layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- measure every outcome, rejections included
/// 2. `AdmissionLayer` -- reject when the concurrency budget is spent
/// 3. `TimeoutLayer` -- run the handler as a task under the time budget
#[must_use]
pub fn build_governor_pipeline(
    invoker: HandlerInvoker,
    sink: Arc<dyn TelemetrySink>,
    admission: Arc<AdmissionControl>,
    request_timeout: Duration,
    detached: Arc<DetachedTasks>,
) -> GovernorStack {
    ServiceBuilder::new()
        .layer(MetricsLayer::new(sink))
        .layer(AdmissionLayer::new(admission))
        .layer(TimeoutLayer::new(request_timeout, detached))
        .service(invoker)
}
