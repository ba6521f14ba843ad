//! The service host: configuration, route registration and the lifecycle of
//! the dispatcher.
//!
//! Follows a deferred startup pattern:
//! 1. `new()` -- validates configuration; routes and migrations are added
//! 2. `start()` -- opens the pool, applies migrations, binds the listener and
//!    launches the dispatch loop on the configured execution context
//! 3. `shutdown()` -- drains in-flight requests, then releases the pool and
//!    the execution context

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harbor_core::Migration;
use http::Method;
use tokio::net::TcpListener;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::network::{
    build_router, AppState, ConfigError, ExecutionMode, HostConfig, HostState, ShutdownController,
};
use crate::service::{RequestGovernor, RouteError, RouteGroup, RouteHandler, RouteRegistry};
use crate::storage::{
    ConnectionPool, MemoryStore, MigrationError, StorageBackend, TransactionManager,
};
use crate::telemetry::{MetricsSink, TelemetrySink};

/// Time given to abandoned requests to answer before the dispatch loop is
/// aborted.
const ABANDON_SETTLE: Duration = Duration::from_millis(200);

/// Lifecycle and startup failures of a [`ServiceHost`].
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("host already started")]
    AlreadyStarted,
    #[error("host not started")]
    NotStarted,
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("migrations failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to build the dedicated runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("startup task failed: {0}")]
    Startup(String),
    #[error("blocking lifecycle calls need a dedicated execution context")]
    NotDedicated,
}

/// Outcome of [`ServiceHost::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ShutdownReport {
    /// Every in-flight request finished within the grace period.
    pub drained: bool,
    /// Requests still in flight when the grace period ran out.
    pub abandoned_requests: u64,
    /// Timed-out handlers still running when the pool was released.
    pub abandoned_handlers: usize,
    pub elapsed: Duration,
}

impl ShutdownReport {
    fn never_served() -> Self {
        Self {
            drained: true,
            abandoned_requests: 0,
            abandoned_handlers: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Returned by [`ServiceHost::start`] without waiting for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    local_addr: SocketAddr,
    done: watch::Receiver<bool>,
}

impl DispatchHandle {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Waits until the dispatch loop has exited.
    pub async fn wait(&mut self) {
        // A dropped sender means the loop task is gone too.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

struct Running {
    serve: JoinHandle<()>,
    governor: RequestGovernor,
    transactions: Arc<TransactionManager>,
    local_addr: SocketAddr,
}

// ---------------------------------------------------------------------------
// ServiceHost
// ---------------------------------------------------------------------------

/// Embeddable request-serving host.
///
/// State machine: Created -> Started -> Draining -> Stopped. Routes can only
/// be registered while Created; the registry is frozen at start.
pub struct ServiceHost {
    config: Arc<HostConfig>,
    registry: Option<RouteRegistry>,
    migrations: Vec<Migration>,
    backend: Arc<dyn StorageBackend>,
    sink: Arc<dyn TelemetrySink>,
    lifecycle: Arc<ShutdownController>,
    runtime: Option<Runtime>,
    running: Option<Running>,
    report: Option<ShutdownReport>,
}

impl ServiceHost {
    /// Creates a host with an in-memory store and the `metrics` sink.
    ///
    /// # Errors
    ///
    /// [`HostError::InvalidConfig`] if any limit is not positive.
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            registry: Some(RouteRegistry::new()),
            migrations: Vec::new(),
            backend: Arc::new(MemoryStore::new()),
            sink: Arc::new(MetricsSink),
            lifecycle: Arc::new(ShutdownController::new()),
            runtime: None,
            running: None,
            report: None,
        })
    }

    #[must_use]
    pub fn with_storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Declares the ordered migration sequence applied at start.
    #[must_use]
    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Registers a single route.
    ///
    /// # Errors
    ///
    /// [`HostError::AlreadyStarted`] once the host has started, or the
    /// registry's [`RouteError`].
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl RouteHandler,
    ) -> Result<&mut Self, HostError> {
        self.registry_mut()?.register(method, pattern, handler)?;
        Ok(self)
    }

    /// Mounts a route group; all or nothing.
    ///
    /// # Errors
    ///
    /// Same as [`route`](Self::route).
    pub fn mount(&mut self, group: RouteGroup) -> Result<&mut Self, HostError> {
        self.registry_mut()?.mount(group)?;
        Ok(self)
    }

    fn registry_mut(&mut self) -> Result<&mut RouteRegistry, HostError> {
        self.registry.as_mut().ok_or(HostError::AlreadyStarted)
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> HostState {
        self.lifecycle.state()
    }

    /// The running governor, for its counters.
    #[must_use]
    pub fn governor(&self) -> Option<&RequestGovernor> {
        self.running.as_ref().map(|r| &r.governor)
    }

    #[must_use]
    pub fn transactions(&self) -> Option<Arc<TransactionManager>> {
        self.running.as_ref().map(|r| Arc::clone(&r.transactions))
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Starts serving and returns once the dispatch loop is launched.
    ///
    /// A failed start releases whatever it created and leaves the host
    /// `Stopped`.
    ///
    /// # Errors
    ///
    /// - [`HostError::AlreadyStarted`] unless the host is `Created`
    /// - [`HostError::Migration`] if the migration run fails
    /// - [`HostError::Bind`] if the listener cannot bind
    pub async fn start(&mut self) -> Result<DispatchHandle, HostError> {
        if self.lifecycle.state() != HostState::Created {
            return Err(HostError::AlreadyStarted);
        }
        let registry = self.registry.take().ok_or(HostError::AlreadyStarted)?;

        let bring_up = BringUp {
            config: Arc::clone(&self.config),
            registry,
            migrations: self.migrations.clone(),
            backend: Arc::clone(&self.backend),
            sink: Arc::clone(&self.sink),
            lifecycle: Arc::clone(&self.lifecycle),
        };

        let execution = self.config.execution;
        let result = match execution {
            ExecutionMode::Ambient => bring_up.run().await,
            ExecutionMode::Dedicated { worker_threads } => match self.ensure_runtime(worker_threads) {
                Ok(handle) => match handle.spawn(bring_up.run()).await {
                    Ok(result) => result,
                    Err(e) => Err(HostError::Startup(e.to_string())),
                },
                Err(e) => Err(e),
            },
        };

        match result {
            Ok((running, handle)) => {
                self.running = Some(running);
                Ok(handle)
            }
            Err(e) => {
                error!(error = %e, "host failed to start");
                self.lifecycle.set_stopped();
                self.report = Some(ShutdownReport::never_served());
                if let Some(runtime) = self.runtime.take() {
                    runtime.shutdown_background();
                }
                Err(e)
            }
        }
    }

    /// Drains in-flight requests and releases every resource.
    ///
    /// Once `Stopped`, further calls return the first report.
    ///
    /// # Errors
    ///
    /// [`HostError::NotStarted`] if the host was never started.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, HostError> {
        let report = self.drain().await?;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        Ok(report)
    }

    /// [`start`](Self::start) for callers outside any async runtime.
    ///
    /// # Errors
    ///
    /// [`HostError::NotDedicated`] unless configured with
    /// [`ExecutionMode::Dedicated`]; otherwise as [`start`](Self::start).
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn start_blocking(&mut self) -> Result<DispatchHandle, HostError> {
        let ExecutionMode::Dedicated { worker_threads } = self.config.execution else {
            return Err(HostError::NotDedicated);
        };
        let handle = self.ensure_runtime(worker_threads)?;
        handle.block_on(self.start())
    }

    /// [`shutdown`](Self::shutdown) for callers outside any async runtime.
    /// Waits up to the grace period for the runtime's threads to stop.
    ///
    /// # Errors
    ///
    /// [`HostError::NotDedicated`] unless configured with
    /// [`ExecutionMode::Dedicated`]; otherwise as [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn shutdown_blocking(&mut self) -> Result<ShutdownReport, HostError> {
        if !matches!(self.config.execution, ExecutionMode::Dedicated { .. }) {
            return Err(HostError::NotDedicated);
        }
        let Some(handle) = self.runtime.as_ref().map(|rt| rt.handle().clone()) else {
            return self.finished_report();
        };
        let report = handle.block_on(self.drain())?;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.config.shutdown_grace);
        }
        Ok(report)
    }

    fn ensure_runtime(&mut self, worker_threads: usize) -> Result<Handle, HostError> {
        if let Some(runtime) = &self.runtime {
            return Ok(runtime.handle().clone());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("harbor-dispatch")
            .enable_all()
            .build()
            .map_err(HostError::Runtime)?;
        let handle = runtime.handle().clone();
        self.runtime = Some(runtime);
        Ok(handle)
    }

    fn finished_report(&self) -> Result<ShutdownReport, HostError> {
        match self.lifecycle.state() {
            HostState::Stopped => self.report.clone().ok_or(HostError::NotStarted),
            _ => Err(HostError::NotStarted),
        }
    }

    async fn drain(&mut self) -> Result<ShutdownReport, HostError> {
        let Some(running) = self.running.take() else {
            return self.finished_report();
        };

        let started = Instant::now();
        let grace = self.config.shutdown_grace;
        let deadline = started + grace;
        info!(
            in_flight = self.lifecycle.in_flight_count(),
            "shutting down, draining in-flight requests"
        );
        self.lifecycle.trigger_shutdown();

        let drained = self.lifecycle.wait_for_drain(grace).await;
        let abandoned_requests = self.lifecycle.in_flight_count();
        if !drained {
            warn!(
                abandoned_requests,
                "grace period expired with requests in flight"
            );
        }

        if !drained {
            self.lifecycle.abandon_in_flight();
        }

        let mut serve = running.serve;
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(ABANDON_SETTLE);
        if tokio::time::timeout(remaining, &mut serve).await.is_err() {
            warn!("dispatch loop did not stop within the grace period, aborting it");
            serve.abort();
            let _ = serve.await;
        }

        // Checked-out connections are never closed under their holder; the
        // pool closes them when they come back.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !running.transactions.pool().close(remaining).await {
            warn!("connections still checked out when the pool closed");
        }

        let abandoned_handlers = running.governor.detached();
        if abandoned_handlers > 0 {
            warn!(
                abandoned_handlers,
                "handlers still running at shutdown"
            );
        }

        self.lifecycle.set_stopped();
        let report = ShutdownReport {
            drained,
            abandoned_requests,
            abandoned_handlers,
            elapsed: started.elapsed(),
        };
        info!(
            drained,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "host stopped"
        );
        self.report = Some(report.clone());
        Ok(report)
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        if self.running.is_some() {
            self.lifecycle.trigger_shutdown();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ---------------------------------------------------------------------------
// Bring-up
// ---------------------------------------------------------------------------

/// Everything `start()` needs, moved onto the execution context.
struct BringUp {
    config: Arc<HostConfig>,
    registry: RouteRegistry,
    migrations: Vec<Migration>,
    backend: Arc<dyn StorageBackend>,
    sink: Arc<dyn TelemetrySink>,
    lifecycle: Arc<ShutdownController>,
}

impl BringUp {
    async fn run(self) -> Result<(Running, DispatchHandle), HostError> {
        let pool = ConnectionPool::new(self.backend, self.config.pool_config());
        let transactions = Arc::new(TransactionManager::new(pool.clone()));

        let report = match transactions.apply_migrations(&self.migrations).await {
            Ok(report) => report,
            Err(e) => {
                pool.close(Duration::ZERO).await;
                return Err(e.into());
            }
        };
        info!(
            applied = report.applied.len(),
            already_applied = report.already_applied,
            version = ?report.current_version,
            "migrations complete"
        );

        let addr = self.config.bind_addr();
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                pool.close(Duration::ZERO).await;
                return Err(HostError::Bind { addr, source });
            }
        };
        info!("listener bound to {local_addr}");

        let governor = RequestGovernor::new(
            self.config.governor_config(),
            self.sink,
            Some(Arc::clone(&transactions)),
        );
        let router = build_router(AppState {
            lifecycle: Arc::clone(&self.lifecycle),
            registry: Arc::new(self.registry),
            governor: governor.clone(),
            transactions: Arc::clone(&transactions),
            config: Arc::clone(&self.config),
            schema_version: report.current_version,
            start_time: Instant::now(),
        });

        let mut shutdown_rx = self.lifecycle.shutdown_receiver();
        let (done_tx, done_rx) = watch::channel(false);
        self.lifecycle.set_started();

        let serve = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "dispatch loop failed");
            }
            let _ = done_tx.send(true);
        });

        Ok((
            Running {
                serve,
                governor,
                transactions,
                local_addr,
            },
            DispatchHandle {
                local_addr,
                done: done_rx,
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
