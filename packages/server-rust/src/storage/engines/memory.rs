//! In-memory [`StorageBackend`] with optimistic concurrency control.
//!
//! Committed state lives behind a single mutex. Each transaction buffers its
//! writes locally and remembers the version of every row (and the generation
//! of every table) it observed. Commit re-checks those observations under the
//! lock: if anything moved, the transaction is discarded with
//! [`StoreError::Conflict`] and nothing is applied (first committer wins).
//!
//! When opened with a snapshot path, every commit writes the full state to a
//! temporary file and renames it over the snapshot before the new state is
//! published, so a commit that returns `Ok` survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::engine::{StorageBackend, StorageConnection};
use crate::storage::error::{ConflictReason, StoreError};

// ---------------------------------------------------------------------------
// Committed state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    /// Commit sequence number that last wrote this row.
    version: u64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Table {
    /// Commit sequence number that created this table generation.
    created_seq: u64,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    seq: u64,
    tables: BTreeMap<String, Table>,
}

impl StoreState {
    fn table_seq(&self, table: &str) -> Option<u64> {
        self.tables.get(table).map(|t| t.created_seq)
    }

    fn row_version(&self, table: &str, key: &str) -> Option<u64> {
        self.tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .map(|r| r.version)
    }
}

struct Shared {
    state: Mutex<StoreState>,
    snapshot_path: Option<PathBuf>,
    available: AtomicBool,
    next_conn_id: AtomicU64,
    open_connections: AtomicUsize,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Embedded transactional key-value store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an empty store that lives only as long as the process.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(StoreState::default(), None)
    }

    /// Opens a durable store backed by the snapshot file at `path`.
    ///
    /// A missing file starts an empty store; the file is created on the first
    /// commit.
    ///
    /// Every committing write re-encodes the whole store and `fsync`s the
    /// snapshot while holding the store lock, on the calling task. Other
    /// sessions block on that lock for the duration, so a durable store suits
    /// small data sets and modest write rates.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => rmp_serde::from_slice::<StoreState>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            tables = state.tables.len(),
            seq = state.seq,
            "opened storage snapshot"
        );
        Ok(Self::with_state(state, Some(path)))
    }

    fn with_state(state: StoreState, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                snapshot_path,
                available: AtomicBool::new(true),
                next_conn_id: AtomicU64::new(1),
                open_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulates the store going away (or coming back). While unavailable,
    /// `connect` and `ping` fail and every open session is marked broken on
    /// its next operation.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Number of sessions currently open against this store.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    /// Sequence number of the last successful commit.
    #[must_use]
    pub fn commit_seq(&self) -> u64 {
        self.shared.state.lock().seq
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.shared.state.lock().tables.keys().cloned().collect()
    }

    /// Committed row count of `table`, or `None` if it does not exist.
    #[must_use]
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.shared.state.lock().tables.get(table).map(|t| t.rows.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn StorageConnection>, StoreError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionBroken("store unavailable".to_string()));
        }
        let id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!(conn = id, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            txn: None,
            broken: false,
        }))
    }
}

fn write_snapshot(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let bytes = rmp_serde::to_vec_named(state)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Transaction buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableOp {
    Create,
    Drop,
    /// Dropped and created again within one transaction.
    Recreate,
}

#[derive(Debug)]
enum Write {
    Put(Vec<u8>),
    Insert(Vec<u8>),
    Delete,
}

#[derive(Debug, Default)]
struct TxnBuffer {
    row_reads: HashMap<(String, String), Option<u64>>,
    table_reads: HashMap<String, Option<u64>>,
    writes: BTreeMap<(String, String), Write>,
    table_ops: BTreeMap<String, TableOp>,
}

impl TxnBuffer {
    fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.table_ops.is_empty()
    }

    /// Checks that `table` is visible and records its observed generation.
    ///
    /// Returns `true` when the table was created by this transaction, in
    /// which case no committed rows are visible through it.
    fn visible_table(&mut self, state: &StoreState, table: &str) -> Result<bool, StoreError> {
        match self.table_ops.get(table) {
            Some(TableOp::Drop) => Err(StoreError::NoSuchTable(table.to_string())),
            Some(TableOp::Create | TableOp::Recreate) => Ok(true),
            None => {
                let seq = state.table_seq(table);
                self.table_reads.entry(table.to_string()).or_insert(seq);
                if seq.is_some() {
                    Ok(false)
                } else {
                    Err(StoreError::NoSuchTable(table.to_string()))
                }
            }
        }
    }

    fn observe_row(&mut self, state: &StoreState, table: &str, key: &str) {
        self.row_reads
            .entry((table.to_string(), key.to_string()))
            .or_insert_with(|| state.row_version(table, key));
    }

    fn read_row(
        &mut self,
        state: &StoreState,
        table: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let fresh = self.visible_table(state, table)?;
        if let Some(write) = self.writes.get(&(table.to_string(), key.to_string())) {
            return Ok(match write {
                Write::Put(data) | Write::Insert(data) => Some(data.clone()),
                Write::Delete => None,
            });
        }
        if fresh {
            return Ok(None);
        }
        self.observe_row(state, table, key);
        Ok(state
            .tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .map(|r| r.data.clone()))
    }

    fn write_row(
        &mut self,
        state: &StoreState,
        table: &str,
        key: &str,
        write: Write,
    ) -> Result<(), StoreError> {
        if !self.visible_table(state, table)? {
            self.observe_row(state, table, key);
        }
        self.writes
            .insert((table.to_string(), key.to_string()), write);
        Ok(())
    }

    fn scan(&mut self, state: &StoreState, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let fresh = self.visible_table(state, table)?;
        let mut rows: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if !fresh {
            if let Some(t) = state.tables.get(table) {
                for (key, row) in &t.rows {
                    self.row_reads
                        .entry((table.to_string(), key.clone()))
                        .or_insert(Some(row.version));
                    rows.insert(key.clone(), row.data.clone());
                }
            }
        }
        for ((t, key), write) in self.writes.range((table.to_string(), String::new())..) {
            if t != table {
                break;
            }
            match write {
                Write::Put(data) | Write::Insert(data) => {
                    rows.insert(key.clone(), data.clone());
                }
                Write::Delete => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    fn create_table(&mut self, state: &StoreState, table: &str) -> Result<(), StoreError> {
        match self.table_ops.get(table).copied() {
            Some(TableOp::Create | TableOp::Recreate) => {
                Err(StoreError::TableExists(table.to_string()))
            }
            Some(TableOp::Drop) => {
                self.table_ops.insert(table.to_string(), TableOp::Recreate);
                Ok(())
            }
            None => {
                let seq = state.table_seq(table);
                self.table_reads.entry(table.to_string()).or_insert(seq);
                if seq.is_some() {
                    return Err(StoreError::TableExists(table.to_string()));
                }
                self.table_ops.insert(table.to_string(), TableOp::Create);
                Ok(())
            }
        }
    }

    fn drop_table(&mut self, state: &StoreState, table: &str) -> Result<(), StoreError> {
        match self.table_ops.get(table).copied() {
            Some(TableOp::Drop) => return Err(StoreError::NoSuchTable(table.to_string())),
            Some(TableOp::Create) => {
                self.table_ops.remove(table);
            }
            Some(TableOp::Recreate) => {
                self.table_ops.insert(table.to_string(), TableOp::Drop);
            }
            None => {
                let seq = state.table_seq(table);
                self.table_reads.entry(table.to_string()).or_insert(seq);
                if seq.is_none() {
                    return Err(StoreError::NoSuchTable(table.to_string()));
                }
                self.table_ops.insert(table.to_string(), TableOp::Drop);
            }
        }
        self.writes.retain(|(t, _), _| t != table);
        Ok(())
    }

    /// Re-checks every observation against the committed state.
    fn validate(&self, state: &StoreState) -> Result<(), StoreError> {
        for (table, observed) in &self.table_reads {
            if state.table_seq(table) != *observed {
                return Err(StoreError::conflict(table, None, ConflictReason::TableChanged));
            }
        }
        for ((table, key), observed) in &self.row_reads {
            let current = state.row_version(table, key);
            if current != *observed {
                let reason = match self.writes.get(&(table.clone(), key.clone())) {
                    Some(Write::Insert(_)) if current.is_some() => ConflictReason::AlreadyExists,
                    _ => ConflictReason::Modified,
                };
                return Err(StoreError::conflict(table, Some(key), reason));
            }
        }
        Ok(())
    }

    fn apply(self, state: &mut StoreState) {
        state.seq += 1;
        let seq = state.seq;
        for (table, op) in self.table_ops {
            match op {
                TableOp::Drop => {
                    state.tables.remove(&table);
                }
                TableOp::Create | TableOp::Recreate => {
                    state.tables.insert(
                        table,
                        Table {
                            created_seq: seq,
                            rows: BTreeMap::new(),
                        },
                    );
                }
            }
        }
        for ((table, key), write) in self.writes {
            let Some(t) = state.tables.get_mut(&table) else {
                continue;
            };
            match write {
                Write::Put(data) | Write::Insert(data) => {
                    t.rows.insert(key, Row { version: seq, data });
                }
                Write::Delete => {
                    t.rows.remove(&key);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// A session against a [`MemoryStore`].
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    txn: Option<TxnBuffer>,
    broken: bool,
}

impl MemoryConnection {
    fn check_available(&mut self) -> Result<(), StoreError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            self.broken = true;
        }
        if self.broken {
            return Err(StoreError::ConnectionBroken(format!(
                "connection {} lost its store",
                self.id
            )));
        }
        Ok(())
    }

    fn active(&mut self) -> Result<&mut TxnBuffer, StoreError> {
        self.check_available()?;
        self.txn.as_mut().ok_or(StoreError::NoActiveTransaction)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.check_available()
    }

    fn is_usable(&self) -> bool {
        !self.broken && self.txn.is_none() && self.shared.available.load(Ordering::SeqCst)
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.check_available()?;
        if self.txn.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        self.txn = Some(TxnBuffer::default());
        Ok(())
    }

    async fn get(&mut self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        txn.read_row(&state, table, key)
    }

    async fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        txn.write_row(&state, table, key, Write::Put(value))
    }

    async fn insert(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        if txn.read_row(&state, table, key)?.is_some() {
            return Err(StoreError::conflict(
                table,
                Some(key),
                ConflictReason::AlreadyExists,
            ));
        }
        txn.write_row(&state, table, key, Write::Insert(value))
    }

    async fn delete(&mut self, table: &str, key: &str) -> Result<bool, StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        let existed = txn.read_row(&state, table, key)?.is_some();
        txn.write_row(&state, table, key, Write::Delete)?;
        Ok(existed)
    }

    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        txn.scan(&state, table)
    }

    async fn create_table(&mut self, table: &str) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        txn.create_table(&state, table)
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        let txn = self.active()?;
        let state = shared.state.lock();
        txn.drop_table(&state, table)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check_available()?;
        let txn = self.txn.take().ok_or(StoreError::NoActiveTransaction)?;
        // Read-only transactions have nothing to publish.
        if txn.is_read_only() {
            return Ok(());
        }

        let mut state = self.shared.state.lock();
        txn.validate(&state)?;
        match &self.shared.snapshot_path {
            Some(path) => {
                let mut next = state.clone();
                txn.apply(&mut next);
                write_snapshot(path, &next)?;
                *state = next;
            }
            None => txn.apply(&mut state),
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.txn
            .take()
            .map(|_| ())
            .ok_or(StoreError::NoActiveTransaction)
    }

    fn close(self: Box<Self>) {
        debug!(conn = self.id, "memory connection closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_table(table: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        conn.begin().await.unwrap();
        conn.create_table(table).await.unwrap();
        conn.commit().await.unwrap();
        store
    }

    async fn open_tx(store: &MemoryStore) -> Box<dyn StorageConnection> {
        let mut conn = store.connect().await.unwrap();
        conn.begin().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn reads_see_own_writes_but_not_others_uncommitted() {
        let store = store_with_table("notes").await;
        let mut a = open_tx(&store).await;
        let mut b = open_tx(&store).await;

        a.put("notes", "1", b"one".to_vec()).await.unwrap();
        assert_eq!(a.get("notes", "1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(b.get("notes", "1").await.unwrap(), None);

        a.commit().await.unwrap();
        let mut c = open_tx(&store).await;
        assert_eq!(c.get("notes", "1").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_key_first_committer_wins() {
        let store = store_with_table("notes").await;
        let mut a = open_tx(&store).await;
        let mut b = open_tx(&store).await;

        a.put("notes", "k", b"a".to_vec()).await.unwrap();
        b.put("notes", "k", b"b".to_vec()).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                reason: ConflictReason::Modified,
                ..
            }
        ));
        // The losing transaction was discarded.
        assert!(b.is_usable());

        let mut c = open_tx(&store).await;
        assert_eq!(c.get("notes", "k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn concurrent_insert_of_same_key_is_constraint_conflict() {
        let store = store_with_table("users").await;
        let mut a = open_tx(&store).await;
        let mut b = open_tx(&store).await;

        a.insert("users", "alice", b"1".to_vec()).await.unwrap();
        b.insert("users", "alice", b"2".to_vec()).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                reason: ConflictReason::AlreadyExists,
                ..
            }
        ));
        assert_eq!(store.row_count("users"), Some(1));
    }

    #[tokio::test]
    async fn insert_of_visible_key_fails_immediately() {
        let store = store_with_table("users").await;
        let mut a = open_tx(&store).await;
        a.put("users", "bob", b"x".to_vec()).await.unwrap();
        let err = a.insert("users", "bob", b"y".to_vec()).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn stale_read_invalidates_a_writing_transaction() {
        let store = store_with_table("accounts").await;
        let mut setup = open_tx(&store).await;
        setup.put("accounts", "a", b"100".to_vec()).await.unwrap();
        setup.commit().await.unwrap();

        let mut reader = open_tx(&store).await;
        assert!(reader.get("accounts", "a").await.unwrap().is_some());

        let mut writer = open_tx(&store).await;
        writer.put("accounts", "a", b"50".to_vec()).await.unwrap();
        writer.commit().await.unwrap();

        reader.put("accounts", "b", b"100".to_vec()).await.unwrap();
        let err = reader.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.row_count("accounts"), Some(1));
    }

    #[tokio::test]
    async fn read_only_transaction_commits_despite_concurrent_change() {
        let store = store_with_table("t").await;
        let mut reader = open_tx(&store).await;
        let _ = reader.get("t", "k").await.unwrap();

        let mut writer = open_tx(&store).await;
        writer.put("t", "k", b"v".to_vec()).await.unwrap();
        writer.commit().await.unwrap();

        reader.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = store_with_table("t").await;
        let mut tx = open_tx(&store).await;
        tx.put("t", "k", b"v".to_vec()).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.row_count("t"), Some(0));
        assert!(matches!(
            tx.rollback().await,
            Err(StoreError::NoActiveTransaction)
        ));
    }

    #[tokio::test]
    async fn operations_require_an_open_transaction() {
        let store = store_with_table("t").await;
        let mut conn = store.connect().await.unwrap();
        assert!(matches!(
            conn.get("t", "k").await,
            Err(StoreError::NoActiveTransaction)
        ));
        conn.begin().await.unwrap();
        assert!(matches!(
            conn.begin().await,
            Err(StoreError::TransactionInProgress)
        ));
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn missing_table_is_reported() {
        let store = MemoryStore::new();
        let mut tx = open_tx(&store).await;
        assert!(matches!(
            tx.put("nope", "k", Vec::new()).await,
            Err(StoreError::NoSuchTable(t)) if t == "nope"
        ));
    }

    #[tokio::test]
    async fn concurrent_table_creation_conflicts() {
        let store = MemoryStore::new();
        let mut a = open_tx(&store).await;
        let mut b = open_tx(&store).await;
        a.create_table("t").await.unwrap();
        b.create_table("t").await.unwrap();
        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                reason: ConflictReason::TableChanged,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn drop_and_recreate_in_one_transaction_empties_table() {
        let store = store_with_table("t").await;
        let mut setup = open_tx(&store).await;
        setup.put("t", "old", b"1".to_vec()).await.unwrap();
        setup.commit().await.unwrap();

        let mut tx = open_tx(&store).await;
        tx.drop_table("t").await.unwrap();
        assert!(matches!(
            tx.get("t", "old").await,
            Err(StoreError::NoSuchTable(_))
        ));
        tx.create_table("t").await.unwrap();
        tx.put("t", "new", b"2".to_vec()).await.unwrap();
        tx.commit().await.unwrap();

        let mut check = open_tx(&store).await;
        let rows = check.scan("t").await.unwrap();
        assert_eq!(rows, vec![("new".to_string(), b"2".to_vec())]);
    }

    #[tokio::test]
    async fn scan_merges_buffered_writes_in_key_order() {
        let store = store_with_table("t").await;
        let mut setup = open_tx(&store).await;
        setup.put("t", "a", b"1".to_vec()).await.unwrap();
        setup.put("t", "c", b"3".to_vec()).await.unwrap();
        setup.commit().await.unwrap();

        let mut tx = open_tx(&store).await;
        tx.put("t", "b", b"2".to_vec()).await.unwrap();
        assert!(tx.delete("t", "c").await.unwrap());
        let keys: Vec<String> = tx.scan("t").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unavailable_store_breaks_sessions() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        conn.ping().await.unwrap();

        store.set_available(false);
        assert!(conn.ping().await.is_err());
        assert!(!conn.is_usable());
        assert!(store.connect().await.is_err());

        // A broken session stays broken even after the store recovers.
        store.set_available(true);
        assert!(conn.ping().await.is_err());
        assert!(store.connect().await.is_ok());
    }

    #[tokio::test]
    async fn open_connection_count_tracks_close() {
        let store = MemoryStore::new();
        let a = store.connect().await.unwrap();
        let b = store.connect().await.unwrap();
        assert_eq!(store.open_connections(), 2);
        a.close();
        drop(b);
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.db");

        {
            let store = MemoryStore::open(&path).unwrap();
            let mut tx = open_tx(&store).await;
            tx.create_table("notes").await.unwrap();
            tx.put("notes", "1", b"persisted".to_vec()).await.unwrap();
            tx.commit().await.unwrap();

            let mut abandoned = open_tx(&store).await;
            abandoned.put("notes", "2", b"lost".to_vec()).await.unwrap();
            abandoned.rollback().await.unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.table_names(), vec!["notes".to_string()]);
        assert_eq!(reopened.commit_seq(), 1);
        let mut tx = open_tx(&reopened).await;
        assert_eq!(
            tx.get("notes", "1").await.unwrap(),
            Some(b"persisted".to_vec())
        );
        assert_eq!(tx.get("notes", "2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.db");
        std::fs::write(&path, b"not msgpack").unwrap();
        assert!(MemoryStore::open(&path).is_err());
    }
}
