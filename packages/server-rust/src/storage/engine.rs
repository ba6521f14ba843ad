//! Storage engine traits.
//!
//! Defines [`StorageBackend`], the factory for sessions, and
//! [`StorageConnection`], a single session that runs at most one transaction
//! at a time. The pool and transaction manager only ever talk to these traits,
//! so engines are pluggable. Values are opaque bytes at this level; typed
//! encoding happens in [`Transaction`](super::Transaction).

use async_trait::async_trait;

use super::error::StoreError;

/// Source of new storage sessions.
///
/// Wrapped in `Arc<dyn StorageBackend>` and shared with the
/// [`ConnectionPool`](super::ConnectionPool).
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Short engine name for logs and health output (e.g. `"memory"`).
    fn name(&self) -> &'static str;

    /// Open a new session.
    async fn connect(&self) -> Result<Box<dyn StorageConnection>, StoreError>;
}

/// A single storage session.
///
/// Data operations are only legal between [`begin`](Self::begin) and
/// [`commit`](Self::commit)/[`rollback`](Self::rollback); outside a
/// transaction they fail with [`StoreError::NoActiveTransaction`].
#[async_trait]
pub trait StorageConnection: Send + 'static {
    /// Engine-unique session id, stable for the session's lifetime.
    fn id(&self) -> u64;

    /// Round-trip health check used by the pool before handing out an idle
    /// session.
    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Cheap local check used when the session is returned to the pool.
    ///
    /// Must return `false` if the session is broken or still has a
    /// transaction open; such sessions are closed instead of reused.
    fn is_usable(&self) -> bool;

    /// Open a transaction.
    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Read a row, seeing this transaction's own writes.
    async fn get(&mut self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a row, replacing any existing value.
    async fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Write a row that must not exist yet. A concurrent insert of the same
    /// key surfaces as a conflict at commit.
    async fn insert(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a row. Returns whether it was visible to this transaction.
    async fn delete(&mut self, table: &str, key: &str) -> Result<bool, StoreError>;

    /// All rows of a table in key order, including this transaction's writes.
    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn create_table(&mut self, table: &str) -> Result<(), StoreError>;

    async fn drop_table(&mut self, table: &str) -> Result<(), StoreError>;

    /// Make the transaction durable.
    ///
    /// On [`StoreError::Conflict`] nothing is applied and the transaction is
    /// already discarded when this returns.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the transaction. Fails only if none is open.
    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Release the session's resources.
    fn close(self: Box<Self>);
}
