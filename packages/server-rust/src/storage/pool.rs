//! Bounded pool of storage sessions.
//!
//! A semaphore caps the number of sessions checked out at once. Idle sessions
//! are kept in a FIFO queue and pinged before reuse; sessions that fail the
//! ping, come back broken, or come back with a transaction still open are
//! closed instead of recycled. The open count is therefore never above
//! `max_size`.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::engine::{StorageBackend, StorageConnection};
use super::error::StoreError;

/// Sizing and wait limits for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// How long `acquire` waits for a free slot before failing with
    /// [`StoreError::PoolExhausted`].
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time pool counters, reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub closed: bool,
}

struct PoolState {
    idle: VecDeque<Box<dyn StorageConnection>>,
    open: usize,
    closed: bool,
}

struct PoolInner {
    backend: Arc<dyn StorageBackend>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Takes a session back from a caller.
    fn release(&self, conn: Box<dyn StorageConnection>) {
        let mut state = self.state.lock();
        if state.closed || !conn.is_usable() {
            state.open -= 1;
            drop(state);
            debug!(conn = conn.id(), "closing returned connection");
            conn.close();
            return;
        }
        state.idle.push_back(conn);
    }
}

/// Decrements the open count if a checkout is abandoned midway (error or
/// cancellation) while holding a slot that has no session behind it yet.
struct OpenSlot<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl OpenSlot<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().open -= 1;
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// Shared handle to the pool. Clones refer to the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                backend,
                config,
                permits,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    open: 0,
                    closed: false,
                }),
            }),
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Checks out a live session, waiting up to the configured acquire
    /// timeout for one to free up.
    ///
    /// # Errors
    ///
    /// - [`StoreError::PoolExhausted`] if no slot frees up in time.
    /// - [`StoreError::PoolClosed`] once [`close`](Self::close) has started.
    /// - Any error from the backend while opening a new session.
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        if self.inner.state.lock().closed {
            return Err(StoreError::PoolClosed);
        }

        let started = Instant::now();
        let acquire = Arc::clone(&self.inner.permits).acquire_owned();
        let permit = match tokio::time::timeout(self.inner.config.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StoreError::PoolClosed),
            Err(_) => {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(
                    waited_ms,
                    max_size = self.inner.config.max_size,
                    "connection pool exhausted"
                );
                return Err(StoreError::PoolExhausted { waited_ms });
            }
        };

        if self.inner.state.lock().closed {
            return Err(StoreError::PoolClosed);
        }

        let conn = self.checkout().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Hands back a session. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    async fn checkout(&self) -> Result<Box<dyn StorageConnection>, StoreError> {
        loop {
            let idle = self.inner.state.lock().idle.pop_front();
            let Some(mut conn) = idle else {
                break;
            };
            let slot = OpenSlot {
                pool: &self.inner,
                armed: true,
            };
            match conn.ping().await {
                Ok(()) => {
                    slot.disarm();
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(conn = conn.id(), error = %e, "discarding stale pooled connection");
                    drop(slot);
                    conn.close();
                }
            }
        }

        self.inner.state.lock().open += 1;
        let slot = OpenSlot {
            pool: &self.inner,
            armed: true,
        };
        let conn = self.inner.backend.connect().await?;
        slot.disarm();
        debug!(conn = conn.id(), backend = self.backend_name(), "opened new connection");
        Ok(conn)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max_size: self.inner.config.max_size,
            open: state.open,
            idle: state.idle.len(),
            in_use: state.open - state.idle.len(),
            closed: state.closed,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Closes the pool.
    ///
    /// New acquisitions fail immediately. Idle sessions are closed now;
    /// checked-out sessions are closed as they are returned. Waits up to
    /// `grace` for every session to come back.
    ///
    /// Returns `true` if every session was closed within the grace period.
    pub async fn close(&self, grace: Duration) -> bool {
        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle_len = state.idle.len();
            state.open -= idle_len;
            state.idle.drain(..).collect()
        };
        for conn in idle {
            conn.close();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let open = self.inner.state.lock().open;
            if open == 0 {
                self.inner.permits.close();
                info!("connection pool closed");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                self.inner.permits.close();
                warn!(open, "connection pool closed with sessions still checked out");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A checked-out session. Returns itself to the pool on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn StorageConnection>>,
    pool: Arc<PoolInner>,
    // Released after the session is back in the idle queue.
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn StorageConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(|c| c.id()))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engines::MemoryStore;

    fn pool(store: &MemoryStore, max_size: usize, timeout_ms: u64) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(store.clone()),
            PoolConfig {
                max_size,
                acquire_timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[tokio::test]
    async fn reuses_idle_connections() {
        let store = MemoryStore::new();
        let pool = pool(&store, 2, 100);

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        pool.release(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(store.open_connections(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let store = MemoryStore::new();
        let pool = pool(&store, 1, 30);

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn waiter_gets_connection_when_one_is_released() {
        let store = MemoryStore::new();
        let pool = pool(&store, 1, 1_000);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = held.id();
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn never_opens_more_than_max_size() {
        let store = MemoryStore::new();
        let pool = pool(&store, 3, 1_000);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let _conn = pool.acquire().await.unwrap();
                assert!(store.open_connections() <= 3);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let stats = pool.stats();
        assert!(stats.open <= 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn connection_returned_mid_transaction_is_discarded() {
        let store = MemoryStore::new();
        let pool = pool(&store, 2, 100);

        let mut conn = pool.acquire().await.unwrap();
        conn.begin().await.unwrap();
        drop(conn);

        assert_eq!(store.open_connections(), 0);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn stale_idle_connection_is_replaced() {
        let store = MemoryStore::new();
        let pool = pool(&store, 2, 100);

        let conn = pool.acquire().await.unwrap();
        let stale_id = conn.id();
        drop(conn);
        assert_eq!(pool.stats().idle, 1);

        store.set_available(false);
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().open, 0);
        store.set_available(true);
        let replacement = pool.acquire().await.unwrap();
        assert_ne!(replacement.id(), stale_id);
    }

    #[tokio::test]
    async fn close_waits_for_checked_out_sessions() {
        let store = MemoryStore::new();
        let pool = pool(&store, 2, 100);

        let idle = pool.acquire().await.unwrap();
        let busy = pool.acquire().await.unwrap();
        drop(idle);

        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(pool.acquire().await, Err(StoreError::PoolClosed)));
        assert_eq!(store.open_connections(), 1);

        drop(busy);
        assert!(closer.await.unwrap());
        assert_eq!(store.open_connections(), 0);
        assert!(pool.stats().closed);
    }

    #[tokio::test]
    async fn close_gives_up_after_grace() {
        let store = MemoryStore::new();
        let pool = pool(&store, 1, 100);
        let _busy = pool.acquire().await.unwrap();
        assert!(!pool.close(Duration::from_millis(30)).await);
    }
}
