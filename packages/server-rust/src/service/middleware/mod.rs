//! Tower middleware layers for the request governor.
//!
//! - [`metrics`]: Request timing and outcome reporting
//! - [`admission`]: Semaphore-based concurrency budget, reject when full
//! - [`timeout`]: Per-request time budget with detached-handler tracking
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod admission;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use admission::{AdmissionControl, AdmissionLayer, AdmissionTicket};
pub use metrics::MetricsLayer;
pub use pipeline::{build_governor_pipeline, GovernorStack};
pub use timeout::{DetachedTasks, TimeoutLayer};
