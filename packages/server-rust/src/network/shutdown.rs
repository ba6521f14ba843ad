//! Host lifecycle state with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for accurate in-flight request tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Host lifecycle state.
///
/// State machine: Created -> Started -> Draining -> Stopped. A failed start
/// goes straight from Created to Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Configured, routes still open for registration.
    Created,
    /// Serving requests.
    Started,
    /// No new requests accepted; in-flight ones are finishing.
    Draining,
    /// Resources released.
    Stopped,
}

impl HostState {
    /// Lowercase name used in the health endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates the lifecycle across the host:
/// 1. Health probes read `state()`
/// 2. The dispatch handler answers 503 unless the state is `Started`
/// 3. `trigger_shutdown()` moves to `Draining` and signals the listener
/// 4. `wait_for_drain()` waits until in-flight requests complete
/// 5. `abandon_in_flight()` ends whatever is left once the grace period is up
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    abandon: CancellationToken,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<HostState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            abandon: CancellationToken::new(),
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(HostState::Created)),
        }
    }

    pub fn set_started(&self) {
        self.state.store(Arc::new(HostState::Started));
    }

    pub fn set_stopped(&self) {
        self.state.store(Arc::new(HostState::Stopped));
    }

    /// Returns a receiver notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals all shutdown receivers.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HostState::Draining));
        // Receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
    }

    /// Tells requests still in flight to stop waiting for their handlers.
    pub fn abandon_in_flight(&self) {
        self.abandon.cancel();
    }

    /// Cancelled by [`abandon_in_flight`](Self::abandon_in_flight).
    #[must_use]
    pub fn abandon_token(&self) -> CancellationToken {
        self.abandon.clone()
    }

    #[must_use]
    pub fn state(&self) -> HostState {
        **self.state.load()
    }

    /// Creates an RAII guard that tracks an in-flight request.
    ///
    /// The counter is decremented when the guard drops, including during a
    /// panic unwind or when the request future is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for all in-flight requests to complete, up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first. The state is left to
    /// the caller.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_created() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), HostState::Created);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn state_transitions_created_started_draining_stopped() {
        let controller = ShutdownController::new();

        controller.set_started();
        assert_eq!(controller.state(), HostState::Started);

        controller.trigger_shutdown();
        assert_eq!(controller.state(), HostState::Draining);

        controller.set_stopped();
        assert_eq!(controller.state(), HostState::Stopped);
        assert_eq!(controller.state().as_str(), "stopped");
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let controller = ShutdownController::new();

        let guard1 = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);

        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_for_drain_with_active_requests() {
        let controller = ShutdownController::new();
        controller.set_started();

        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let guard_handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), HostState::Draining);

        guard_handle.await.unwrap();
    }

    #[tokio::test]
    async fn abandon_token_fires_once_abandoned() {
        let controller = ShutdownController::new();
        let token = controller.abandon_token();
        assert!(!token.is_cancelled());

        controller.abandon_in_flight();
        token.cancelled().await;
        assert!(controller.abandon_token().is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_drain_timeout() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.in_flight_count(), 1);
    }
}
