//! Pooled, transactional storage for the `Harbor` host.
//!
//! Layers, bottom up:
//!
//! - [`StorageBackend`] / [`StorageConnection`]: pluggable engine traits, with
//!   the in-memory [`MemoryStore`] as the built-in engine
//! - [`ConnectionPool`]: bounded, health-checked reuse of sessions
//! - [`TransactionManager`]: atomic units of work and schema migrations

pub mod engine;
pub mod engines;
pub mod error;
pub mod migrate;
pub mod pool;
pub mod transaction;

pub use engine::{StorageBackend, StorageConnection};
pub use engines::MemoryStore;
pub use error::{ConflictReason, StoreError};
pub use migrate::{MigrationError, MigrationReport, MigrationStatus};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use transaction::{Transaction, TransactionManager, TxState, TxStats};
