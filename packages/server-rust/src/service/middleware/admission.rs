//! Admission control for requests.
//!
//! Each admitted request holds an [`AdmissionTicket`]: one slot of the
//! `max_concurrency` budget. When no slot is free the request is rejected
//! immediately with `DispatchError::Rejected` rather than queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::service::governor::Invocation;
use crate::service::request::{DispatchError, HostResponse};

// ---------------------------------------------------------------------------
// AdmissionControl
// ---------------------------------------------------------------------------

/// Shared concurrency budget and its counters.
#[derive(Debug)]
pub struct AdmissionControl {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionControl {
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Takes a ticket without waiting, or `None` if the budget is spent.
    #[must_use]
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionTicket> {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Some(AdmissionTicket {
            control: Arc::clone(self),
            _permit: permit,
        })
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Tickets currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of tickets ever held at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Waits until no ticket is held, up to `timeout`.
    ///
    /// Returns `true` if the count reached zero in time.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight() == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// One slot of the concurrency budget, returned on drop.
///
/// The in-flight count is decremented before the semaphore permit is
/// released, so the count never exceeds `max_concurrency`.
#[derive(Debug)]
pub struct AdmissionTicket {
    control: Arc<AdmissionControl>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.control.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// AdmissionLayer
// ---------------------------------------------------------------------------

/// Tower layer that admits requests against an [`AdmissionControl`].
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    control: Arc<AdmissionControl>,
}

impl AdmissionLayer {
    #[must_use]
    pub fn new(control: Arc<AdmissionControl>) -> Self {
        Self { control }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            control: Arc::clone(&self.control),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionService
// ---------------------------------------------------------------------------

/// Service wrapper that holds a ticket for the duration of the inner call.
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    control: Arc<AdmissionControl>,
}

impl<S> Service<Invocation> for AdmissionService<S>
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
        let Some(ticket) = self.control.try_admit() else {
            return Box::pin(async { Err(DispatchError::Rejected) });
        };

        let fut = self.inner.call(inv);
        Box::pin(async move {
            // Held until the inner call resolves, which for a timed-out
            // request is the deadline, not the handler's completion.
            let result = fut.await;
            drop(ticket);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
