//! Transactions and the [`TransactionManager`].
//!
//! A [`Transaction`] owns one pooled connection from `begin` until it reaches
//! a terminal state, so a connection never carries more than one outstanding
//! transaction. Values are `MsgPack`-encoded with field names.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use harbor_core::Model;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::error::StoreError;
use super::pool::{ConnectionPool, PooledConnection};

/// Lifecycle of a [`Transaction`]. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

#[derive(Debug, Default)]
struct TxCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    conflicts: AtomicU64,
    late_commits: AtomicU64,
}

/// Snapshot of transaction counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TxStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// Commits refused by the engine (and rolled back).
    pub conflicts: u64,
    /// Commits that succeeded after the owning request had already timed out.
    pub late_commits: u64,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// An atomic unit of work bound to one storage connection.
///
/// Dropping an open transaction rolls it back: the connection goes back to the
/// pool with its transaction still open, fails the usability check, and is
/// closed, which discards the buffered work.
pub struct Transaction {
    id: u64,
    conn: Option<PooledConnection>,
    state: TxState,
    cancel: Option<CancellationToken>,
    counters: Arc<TxCounters>,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// `true` if the request that opened this transaction has been cancelled
    /// (timed out). Handlers doing long work should check this and bail out.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn conn(&mut self) -> Result<&mut PooledConnection, StoreError> {
        if self.state != TxState::Open {
            return Err(StoreError::TransactionFinished { state: self.state });
        }
        self.conn
            .as_mut()
            .ok_or(StoreError::TransactionFinished { state: self.state })
    }

    pub async fn get<T: DeserializeOwned>(
        &mut self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let bytes = self.conn()?.get(table, key).await?;
        match bytes {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize + ?Sized>(
        &mut self,
        table: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.conn()?.put(table, key, bytes).await
    }

    /// Writes a row that must not exist yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the key is visible now, or at commit if a
    /// concurrent transaction inserted it first.
    pub async fn insert<T: Serialize + ?Sized>(
        &mut self,
        table: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.conn()?.insert(table, key, bytes).await
    }

    pub async fn delete(&mut self, table: &str, key: &str) -> Result<bool, StoreError> {
        self.conn()?.delete(table, key).await
    }

    pub async fn scan<T: DeserializeOwned>(
        &mut self,
        table: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let rows = self.conn()?.scan(table).await?;
        rows.into_iter()
            .map(|(key, bytes)| Ok((key, rmp_serde::from_slice(&bytes)?)))
            .collect()
    }

    pub async fn create_table(&mut self, table: &str) -> Result<(), StoreError> {
        self.conn()?.create_table(table).await
    }

    pub async fn drop_table(&mut self, table: &str) -> Result<(), StoreError> {
        self.conn()?.drop_table(table).await
    }

    // -- Model helpers ------------------------------------------------------

    /// Upserts a record under its own key.
    pub async fn save<M: Model>(&mut self, record: &M) -> Result<(), StoreError> {
        self.put(M::TABLE, &record.key(), record).await
    }

    /// Inserts a record, failing with a conflict if its key is taken.
    pub async fn create<M: Model>(&mut self, record: &M) -> Result<(), StoreError> {
        self.insert(M::TABLE, &record.key(), record).await
    }

    pub async fn find<M: Model>(&mut self, key: &str) -> Result<Option<M>, StoreError> {
        self.get(M::TABLE, key).await
    }

    pub async fn remove<M: Model>(&mut self, key: &str) -> Result<bool, StoreError> {
        self.delete(M::TABLE, key).await
    }

    /// Every record of the model's table, in key order.
    pub async fn all<M: Model>(&mut self) -> Result<Vec<M>, StoreError> {
        let rows = self.scan::<M>(M::TABLE).await?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }

    // -- Completion ---------------------------------------------------------

    /// Makes the work durable.
    ///
    /// On any failure the transaction ends up rolled back and its connection
    /// is returned. A conflict is reported as [`StoreError::Conflict`].
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = conn.commit().await;
        if let Err(e) = &result {
            if !e.is_conflict() {
                // The engine may still hold the transaction after a non-conflict
                // failure. If it cannot let go, the session reports itself
                // unusable and the pool closes it on release.
                if let Err(rollback_err) = conn.rollback().await {
                    debug!(tx = self.id, error = %rollback_err, "engine rollback after failed commit did not apply");
                }
            }
        }
        self.conn = None;

        match result {
            Ok(()) => {
                self.state = TxState::Committed;
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                if self.is_cancelled() {
                    self.counters.late_commits.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tx = self.id,
                        "transaction committed after its request timed out"
                    );
                } else {
                    trace!(tx = self.id, "transaction committed");
                }
                Ok(())
            }
            Err(e) => {
                self.state = TxState::RolledBack;
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                if e.is_conflict() {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(tx = self.id, error = %e, "commit conflict, rolled back");
                } else {
                    warn!(tx = self.id, error = %e, "commit failed, rolled back");
                }
                Err(e)
            }
        }
    }

    /// Discards all work. Only fails if the transaction already finished.
    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if let Err(e) = conn.rollback().await {
            debug!(tx = self.id, error = %e, "engine rollback failed, discarding connection");
        }
        self.conn = None;
        self.state = TxState::RolledBack;
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        trace!(tx = self.id, "transaction rolled back");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            warn!(tx = self.id, "transaction dropped while open, rolling back");
            self.state = TxState::RolledBack;
            self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

/// Opens transactions against a [`ConnectionPool`] and tracks their outcome.
///
/// Migration support lives in `storage::migrate`.
pub struct TransactionManager {
    pool: ConnectionPool,
    counters: Arc<TxCounters>,
    next_id: AtomicU64,
}

impl TransactionManager {
    #[must_use]
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            counters: Arc::new(TxCounters::default()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Acquires a connection and opens a transaction on it.
    ///
    /// # Errors
    ///
    /// Pool errors (`PoolExhausted`, `PoolClosed`) and engine errors from
    /// `begin`.
    pub async fn begin(&self) -> Result<Transaction, StoreError> {
        self.open(None).await
    }

    /// Like [`begin`](Self::begin), tied to a request's cancellation token so a
    /// commit landing after the request timed out is detected.
    pub async fn begin_for_request(
        &self,
        cancel: CancellationToken,
    ) -> Result<Transaction, StoreError> {
        self.open(Some(cancel)).await
    }

    async fn open(&self, cancel: Option<CancellationToken>) -> Result<Transaction, StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.begin().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, conn = conn.id(), "transaction begun");
        Ok(Transaction {
            id,
            conn: Some(conn),
            state: TxState::Open,
            cancel,
            counters: Arc::clone(&self.counters),
        })
    }

    /// See [`Transaction::commit`].
    pub async fn commit(&self, tx: &mut Transaction) -> Result<(), StoreError> {
        tx.commit().await
    }

    /// See [`Transaction::rollback`].
    pub async fn rollback(&self, tx: &mut Transaction) -> Result<(), StoreError> {
        tx.rollback().await
    }

    #[must_use]
    pub fn stats(&self) -> TxStats {
        let c = &self.counters;
        TxStats {
            begun: c.begun.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            rolled_back: c.rolled_back.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            late_commits: c.late_commits.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::storage::engines::MemoryStore;
    use crate::storage::pool::PoolConfig;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Model for Note {
        const TABLE: &'static str = "notes";

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.to_string(),
            body: body.to_string(),
        }
    }

    async fn manager(store: &MemoryStore, max_size: usize) -> TransactionManager {
        let pool = ConnectionPool::new(
            Arc::new(store.clone()),
            PoolConfig {
                max_size,
                acquire_timeout: Duration::from_millis(200),
            },
        );
        let tm = TransactionManager::new(pool);
        let mut tx = tm.begin().await.unwrap();
        tx.create_table(Note::TABLE).await.unwrap();
        tx.commit().await.unwrap();
        tm
    }

    #[tokio::test]
    async fn committed_work_is_visible_to_later_transactions() {
        let store = MemoryStore::new();
        let tm = manager(&store, 2).await;

        let mut tx = tm.begin().await.unwrap();
        tx.save(&note("1", "hello")).await.unwrap();
        assert_eq!(tx.find::<Note>("1").await.unwrap(), Some(note("1", "hello")));
        tm.commit(&mut tx).await.unwrap();
        assert_eq!(tx.state(), TxState::Committed);

        let mut read = tm.begin().await.unwrap();
        assert_eq!(read.all::<Note>().await.unwrap(), vec![note("1", "hello")]);
    }

    #[tokio::test]
    async fn rollback_discards_work() {
        let store = MemoryStore::new();
        let tm = manager(&store, 2).await;

        let mut tx = tm.begin().await.unwrap();
        tx.save(&note("1", "draft")).await.unwrap();
        tm.rollback(&mut tx).await.unwrap();
        assert_eq!(tx.state(), TxState::RolledBack);

        let mut read = tm.begin().await.unwrap();
        assert!(read.find::<Note>("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_transactions_reject_further_operations() {
        let store = MemoryStore::new();
        let tm = manager(&store, 2).await;

        let mut tx = tm.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.save(&note("1", "x")).await,
            Err(StoreError::TransactionFinished {
                state: TxState::Committed
            })
        ));
        assert!(matches!(
            tx.commit().await,
            Err(StoreError::TransactionFinished { .. })
        ));
        assert!(matches!(
            tx.rollback().await,
            Err(StoreError::TransactionFinished { .. })
        ));
    }

    #[tokio::test]
    async fn conflicting_commits_only_one_persists() {
        let store = MemoryStore::new();
        let tm = manager(&store, 4).await;

        let mut a = tm.begin().await.unwrap();
        let mut b = tm.begin().await.unwrap();
        a.save(&note("k", "from a")).await.unwrap();
        b.save(&note("k", "from b")).await.unwrap();

        a.commit().await.unwrap();
        let err = tm.commit(&mut b).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(b.state(), TxState::RolledBack);

        let mut read = tm.begin().await.unwrap();
        assert_eq!(
            read.find::<Note>("k").await.unwrap(),
            Some(note("k", "from a"))
        );
        let stats = tm.stats();
        assert_eq!(stats.conflicts, 1);
        assert!(stats.rolled_back >= 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let store = MemoryStore::new();
        let tm = manager(&store, 4).await;

        let mut a = tm.begin().await.unwrap();
        let mut b = tm.begin().await.unwrap();
        a.create(&note("u", "first")).await.unwrap();
        b.create(&note("u", "second")).await.unwrap();
        a.commit().await.unwrap();
        assert!(b.commit().await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn connection_is_returned_after_commit() {
        let store = MemoryStore::new();
        let tm = manager(&store, 1).await;

        // With a pool of one, a leaked connection would exhaust the pool.
        for i in 0..5 {
            let mut tx = tm.begin().await.unwrap();
            tx.save(&note(&i.to_string(), "x")).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(tm.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn dropped_open_transaction_is_rolled_back() {
        let store = MemoryStore::new();
        let tm = manager(&store, 1).await;

        {
            let mut tx = tm.begin().await.unwrap();
            tx.save(&note("lost", "x")).await.unwrap();
        }
        assert_eq!(store.row_count(Note::TABLE), Some(0));
        assert_eq!(tm.pool().stats().open, 0);

        // The pool replaces the discarded connection.
        let mut tx = tm.begin().await.unwrap();
        assert!(tx.find::<Note>("lost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_after_cancellation_is_counted_as_late() {
        let store = MemoryStore::new();
        let tm = manager(&store, 2).await;
        let cancel = CancellationToken::new();

        let mut tx = tm.begin_for_request(cancel.clone()).await.unwrap();
        tx.save(&note("late", "x")).await.unwrap();
        cancel.cancel();
        assert!(tx.is_cancelled());
        tx.commit().await.unwrap();

        assert_eq!(tm.stats().late_commits, 1);
        assert_eq!(store.row_count(Note::TABLE), Some(1));
    }

    #[tokio::test]
    async fn failed_snapshot_write_rolls_back_and_keeps_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("missing").join("harbor.snap")).unwrap();
        let pool = ConnectionPool::new(Arc::new(store.clone()), PoolConfig::default());
        let tm = TransactionManager::new(pool);

        let mut tx = tm.begin().await.unwrap();
        tx.create_table(Note::TABLE).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(tx.state(), TxState::RolledBack);
        assert_eq!(store.row_count(Note::TABLE), None);

        // The engine had already dropped the transaction, so the session is
        // clean and goes back to the idle set.
        let stats = tm.pool().stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 1);

        let mut again = tm.begin().await.unwrap();
        assert_eq!(store.open_connections(), 1);
        again.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn scan_decodes_in_key_order() {
        let store = MemoryStore::new();
        let tm = manager(&store, 2).await;

        let mut tx = tm.begin().await.unwrap();
        tx.save(&note("b", "2")).await.unwrap();
        tx.save(&note("a", "1")).await.unwrap();
        assert!(tx.remove::<Note>("b").await.unwrap());
        let rows = tx.scan::<Note>(Note::TABLE).await.unwrap();
        assert_eq!(rows, vec![("a".to_string(), note("a", "1"))]);
    }

    #[tokio::test]
    async fn begin_fails_when_pool_is_exhausted() {
        let store = MemoryStore::new();
        let tm = manager(&store, 1).await;

        let _held = tm.begin().await.unwrap();
        assert!(matches!(
            tm.begin().await,
            Err(StoreError::PoolExhausted { .. })
        ));
    }
}
