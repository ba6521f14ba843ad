//! `Harbor` Server: embeddable request host with admission control, per-request
//! timeouts, pooled transactional storage and schema migrations.

pub mod host;
pub mod network;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use host::{DispatchHandle, HostError, ServiceHost, ShutdownReport};
pub use network::{ExecutionMode, HostConfig, HostState};
pub use service::{
    HandlerContext, HandlerError, HostRequest, HostResponse, RouteGroup, RouteHandler,
};
pub use telemetry::{CollectingSink, MetricsSink, TelemetrySink};
