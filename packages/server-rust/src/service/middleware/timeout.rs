//! Timeout middleware for requests.
//!
//! The inner call runs as its own task so that a handler overrunning its
//! deadline is never torn down mid-flight (it may be halfway through a
//! storage commit). On expiry the request fails with
//! `DispatchError::TimedOut`, the handler's cancellation token fires, and the
//! task is tracked as *detached* until it finishes on its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, error, info};

use crate::service::governor::Invocation;
use crate::service::request::{DispatchError, HostResponse};

const RUNNING: u8 = 0;
const DONE: u8 = 1;
const DETACHED: u8 = 2;

/// Counts handler tasks that outlived their request.
#[derive(Debug, Default)]
pub struct DetachedTasks {
    active: AtomicUsize,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

impl DetachedTasks {
    /// Detached handlers still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Handlers detached because their request hit the deadline.
    #[must_use]
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Handlers detached because their request future was dropped.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Lives inside the spawned handler task; settles its state on completion,
/// including when the handler panics.
struct TaskCompletion {
    state: Arc<AtomicU8>,
    tracker: Arc<DetachedTasks>,
    route: Arc<str>,
}

impl Drop for TaskCompletion {
    fn drop(&mut self) {
        let settled = self
            .state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire);
        if settled.is_err() {
            self.tracker.active.fetch_sub(1, Ordering::SeqCst);
            info!(route = %self.route, "handler finished after its request timed out");
        }
    }
}

/// Lives in the request future; detaches the task if the request ends (by
/// timeout or by being dropped) before the handler does.
struct DetachGuard {
    state: Arc<AtomicU8>,
    tracker: Arc<DetachedTasks>,
    cancel: CancellationToken,
    armed: bool,
}

impl DetachGuard {
    /// Returns `false` if the task completed first.
    fn detach(&mut self) -> bool {
        self.armed = false;
        // Count first so the task's decrement can never run ahead of it.
        self.tracker.active.fetch_add(1, Ordering::SeqCst);
        let detached = self
            .state
            .compare_exchange(RUNNING, DETACHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if detached {
            self.cancel.cancel();
        } else {
            self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        }
        detached
    }
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if self.armed && self.detach() {
            self.tracker.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("request dropped before its handler finished");
        }
    }
}

fn flatten(
    joined: Result<Result<HostResponse, DispatchError>, JoinError>,
) -> Result<HostResponse, DispatchError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            error!("route handler panicked");
            Err(DispatchError::Internal("handler panicked".to_string()))
        }
        Err(_) => Err(DispatchError::Internal("handler task was cancelled".to_string())),
    }
}

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that enforces a fixed per-request time budget.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
    detached: Arc<DetachedTasks>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration, detached: Arc<DetachedTasks>) -> Self {
        Self { timeout, detached }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
            detached: Arc::clone(&self.detached),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that runs the inner call as a task under a deadline.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
    detached: Arc<DetachedTasks>,
}

impl<S> Service<Invocation> for TimeoutService<S>
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
        let timeout = self.timeout;
        let cancel = inv.cancel.clone();
        let route = Arc::clone(&inv.route.pattern);
        let tracker = Arc::clone(&self.detached);
        let fut = self.inner.call(inv);

        Box::pin(async move {
            let state = Arc::new(AtomicU8::new(RUNNING));
            let completion = TaskCompletion {
                state: Arc::clone(&state),
                tracker: Arc::clone(&tracker),
                route,
            };
            let mut handle = tokio::spawn(async move {
                let _completion = completion;
                fut.await
            });
            let mut guard = DetachGuard {
                state,
                tracker,
                cancel,
                armed: true,
            };

            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => {
                    guard.armed = false;
                    flatten(joined)
                }
                Err(_elapsed) => {
                    if guard.detach() {
                        guard.tracker.timed_out.fetch_add(1, Ordering::Relaxed);
                        #[allow(clippy::cast_possible_truncation)]
                        let timeout_ms = timeout.as_millis() as u64;
                        Err(DispatchError::TimedOut { timeout_ms })
                    } else {
                        // Finished right at the deadline.
                        flatten(handle.await)
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
