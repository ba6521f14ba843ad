//! Error taxonomy for the storage layer.

use std::fmt;

use super::transaction::TxState;

/// Why a commit was refused by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// A row read or written by this transaction was committed by another
    /// transaction in the meantime.
    Modified,
    /// `insert` targeted a key that exists (uniqueness constraint).
    AlreadyExists,
    /// The table was created, dropped or recreated concurrently.
    TableChanged,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Modified => "modified by a concurrent transaction",
            Self::AlreadyExists => "key already exists",
            Self::TableChanged => "table changed concurrently",
        })
    }
}

/// Errors from the pool, transactions and storage engines.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no storage connection became free within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("transaction conflict on {target}: {reason}")]
    Conflict {
        target: String,
        reason: ConflictReason,
    },
    #[error("transaction already {state}")]
    TransactionFinished { state: TxState },
    #[error("no transaction is open on this connection")]
    NoActiveTransaction,
    #[error("a transaction is already open on this connection")]
    TransactionInProgress,
    #[error("table not found: {0}")]
    NoSuchTable(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("storage connection is broken: {0}")]
    ConnectionBroken(String),
    #[error("record encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("record decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// `true` for serialization and constraint conflicts detected at commit.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// `true` when retrying the same work later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::Conflict { .. } | Self::ConnectionBroken(_)
        )
    }

    pub(crate) fn conflict(table: &str, key: Option<&str>, reason: ConflictReason) -> Self {
        let target = match key {
            Some(key) => format!("{table}/{key}"),
            None => table.to_string(),
        };
        Self::Conflict { target, reason }
    }
}
