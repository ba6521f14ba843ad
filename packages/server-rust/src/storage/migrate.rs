//! Migration runner.
//!
//! Reconciles a declared [`Migration`] sequence with the records in the
//! reserved `_schema_migrations` table and applies whatever is pending. Each
//! step runs in its own transaction together with the insert of its record,
//! so a step is either fully applied and recorded or not at all.

use std::time::{SystemTime, UNIX_EPOCH};

use harbor_core::{
    plan, validate_sequence, Migration, MigrationRecord, SchemaOp, SequenceError,
    MIGRATIONS_TABLE,
};
use tracing::{error, info};

use super::error::StoreError;
use super::transaction::{Transaction, TransactionManager};

/// Failure of a migration run.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    /// A step failed. Steps listed in `applied` were committed by this run
    /// and stay committed.
    #[error("migration {version} ({name}) failed: {source}")]
    StepFailed {
        version: u64,
        name: String,
        applied: Vec<u64>,
        current_version: Option<u64>,
        #[source]
        source: StoreError,
    },
    #[error("migration bookkeeping failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of a successful [`TransactionManager::apply_migrations`] run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<u64>,
    /// Steps that were already applied before this run.
    pub already_applied: usize,
    pub current_version: Option<u64>,
}

/// Read-only view of where the store stands against a declared sequence.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MigrationStatus {
    pub current_version: Option<u64>,
    pub pending: Vec<u64>,
}

impl MigrationStatus {
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

async fn run_op(tx: &mut Transaction, op: &SchemaOp) -> Result<(), StoreError> {
    match op {
        SchemaOp::CreateTable { table } => tx.create_table(table).await,
        SchemaOp::DropTable { table } => tx.drop_table(table).await,
        SchemaOp::Put { table, key, value } => tx.put(table, key, value).await,
        SchemaOp::Delete { table, key } => tx.delete(table, key).await.map(|_| ()),
    }
}

impl TransactionManager {
    /// Applies every declared step not yet recorded, in order.
    ///
    /// Running it again with the same sequence applies nothing.
    ///
    /// # Errors
    ///
    /// - [`MigrationError::Sequence`] if the sequence is malformed or does not
    ///   match what was applied before. Nothing is applied in that case.
    /// - [`MigrationError::StepFailed`] at the first failing step. Earlier
    ///   steps stay committed; the run is not retried.
    pub async fn apply_migrations(
        &self,
        declared: &[Migration],
    ) -> Result<MigrationReport, MigrationError> {
        validate_sequence(declared)?;
        self.ensure_migrations_table().await?;

        let records = self.applied_migrations().await?;
        let plan = plan(declared, &records)?;
        let already_applied = plan.first_pending;
        let mut current_version = plan.current_version;
        let mut applied = Vec::with_capacity(plan.pending.len());

        for step in &declared[plan.first_pending..] {
            info!(version = step.version(), name = step.name(), "applying migration");
            if let Err(source) = self.apply_step(step).await {
                error!(
                    version = step.version(),
                    name = step.name(),
                    error = %source,
                    "migration failed"
                );
                return Err(MigrationError::StepFailed {
                    version: step.version(),
                    name: step.name().to_string(),
                    applied,
                    current_version,
                    source,
                });
            }
            applied.push(step.version());
            current_version = Some(step.version());
        }

        if applied.is_empty() {
            info!(current_version = ?current_version, "schema is up to date");
        } else {
            info!(
                applied = applied.len(),
                current_version = ?current_version,
                "migrations applied"
            );
        }
        Ok(MigrationReport {
            applied,
            already_applied,
            current_version,
        })
    }

    /// Compares `declared` with the applied records without changing anything.
    ///
    /// # Errors
    ///
    /// Same sequence errors as [`apply_migrations`](Self::apply_migrations).
    pub async fn migration_status(
        &self,
        declared: &[Migration],
    ) -> Result<MigrationStatus, MigrationError> {
        let records = self.applied_migrations().await?;
        let plan = plan(declared, &records)?;
        Ok(MigrationStatus {
            current_version: plan.current_version,
            pending: plan.pending,
        })
    }

    /// Applied records in version order. Empty on a store that was never
    /// migrated.
    pub async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        let mut tx = self.begin().await?;
        let records = match tx.all::<MigrationRecord>().await {
            Ok(records) => records,
            Err(StoreError::NoSuchTable(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        tx.rollback().await?;
        Ok(records)
    }

    async fn ensure_migrations_table(&self) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        match tx.create_table(MIGRATIONS_TABLE).await {
            Ok(()) => match tx.commit().await {
                // Another runner created it first.
                Err(e) if e.is_conflict() => Ok(()),
                other => other,
            },
            Err(StoreError::TableExists(_)) => tx.rollback().await,
            Err(e) => Err(e),
        }
    }

    async fn apply_step(&self, step: &Migration) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let record = MigrationRecord {
            version: step.version(),
            name: step.name().to_string(),
            checksum: step.checksum(),
            applied_at_ms: now_ms(),
        };

        let mut staged = Ok(());
        for op in step.ops() {
            staged = run_op(&mut tx, op).await;
            if staged.is_err() {
                break;
            }
        }
        if staged.is_ok() {
            staged = tx.create(&record).await;
        }
        if let Err(e) = staged {
            tx.rollback().await?;
            return Err(e);
        }
        tx.commit().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::storage::engines::MemoryStore;
    use crate::storage::pool::{ConnectionPool, PoolConfig};

    fn manager(store: &MemoryStore) -> TransactionManager {
        TransactionManager::new(ConnectionPool::new(
            Arc::new(store.clone()),
            PoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_millis(200),
            },
        ))
    }

    fn sequence() -> Vec<Migration> {
        vec![
            Migration::new(1, "create notes").create_table("notes"),
            Migration::new(2, "seed welcome note")
                .put("notes", "welcome", json!({"id": "welcome", "body": "hello"})),
            Migration::new(3, "create tags").create_table("tags"),
        ]
    }

    #[tokio::test]
    async fn applies_pending_steps_in_order_then_nothing() {
        let store = MemoryStore::new();
        let tm = manager(&store);

        let first = tm.apply_migrations(&sequence()).await.unwrap();
        assert_eq!(first.applied, vec![1, 2, 3]);
        assert_eq!(first.already_applied, 0);
        assert_eq!(first.current_version, Some(3));

        let second = tm.apply_migrations(&sequence()).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.already_applied, 3);

        let status = tm.migration_status(&sequence()).await.unwrap();
        assert_eq!(status.pending_count(), 0);
        assert_eq!(status.current_version, Some(3));

        let records = tm.applied_migrations().await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(records[0].checksum, sequence()[0].checksum());
    }

    #[tokio::test]
    async fn status_on_fresh_store_lists_everything_pending() {
        let store = MemoryStore::new();
        let tm = manager(&store);

        let status = tm.migration_status(&sequence()).await.unwrap();
        assert_eq!(status.current_version, None);
        assert_eq!(status.pending, vec![1, 2, 3]);
        // Status is read-only.
        assert!(store.table_names().is_empty());
    }

    #[tokio::test]
    async fn extending_the_sequence_applies_only_new_steps() {
        let store = MemoryStore::new();
        let tm = manager(&store);
        let mut steps = sequence();
        let last = steps.pop().unwrap();

        tm.apply_migrations(&steps).await.unwrap();
        steps.push(last);
        let report = tm.apply_migrations(&steps).await.unwrap();
        assert_eq!(report.applied, vec![3]);
        assert_eq!(report.already_applied, 2);
    }

    #[tokio::test]
    async fn seed_rows_are_readable() {
        let store = MemoryStore::new();
        let tm = manager(&store);
        tm.apply_migrations(&sequence()).await.unwrap();

        let mut tx = tm.begin().await.unwrap();
        let seed: Option<serde_json::Value> = tx.get("notes", "welcome").await.unwrap();
        assert_eq!(seed, Some(json!({"id": "welcome", "body": "hello"})));
    }

    #[tokio::test]
    async fn failing_step_keeps_earlier_steps_committed() {
        let store = MemoryStore::new();
        let tm = manager(&store);
        let steps = vec![
            Migration::new(1, "create notes").create_table("notes"),
            Migration::new(2, "create notes again").create_table("notes"),
            Migration::new(3, "never reached").create_table("tags"),
        ];

        let err = tm.apply_migrations(&steps).await.unwrap_err();
        match err {
            MigrationError::StepFailed {
                version,
                applied,
                current_version,
                source,
                ..
            } => {
                assert_eq!(version, 2);
                assert_eq!(applied, vec![1]);
                assert_eq!(current_version, Some(1));
                assert!(matches!(source, StoreError::TableExists(_)));
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }

        let status = tm.migration_status(&steps).await.unwrap();
        assert_eq!(status.current_version, Some(1));
        assert_eq!(status.pending, vec![2, 3]);
        assert!(!store.table_names().contains(&"tags".to_string()));
    }

    #[tokio::test]
    async fn edited_applied_step_is_rejected() {
        let store = MemoryStore::new();
        let tm = manager(&store);
        tm.apply_migrations(&sequence()).await.unwrap();

        let mut edited = sequence();
        edited[1] = Migration::new(2, "seed welcome note").put("notes", "welcome", json!({}));
        let err = tm.apply_migrations(&edited).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Sequence(SequenceError::ChecksumMismatch { version: 2, .. })
        ));
    }

    #[tokio::test]
    async fn non_increasing_sequence_touches_nothing() {
        let store = MemoryStore::new();
        let tm = manager(&store);
        let steps = vec![
            Migration::new(2, "b").create_table("b"),
            Migration::new(1, "a").create_table("a"),
        ];
        let err = tm.apply_migrations(&steps).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Sequence(SequenceError::NotIncreasing { .. })
        ));
        assert!(store.table_names().is_empty());
    }

    #[tokio::test]
    async fn dropping_a_declared_applied_step_is_unknown_version() {
        let store = MemoryStore::new();
        let tm = manager(&store);
        tm.apply_migrations(&sequence()).await.unwrap();

        let truncated = sequence()[..1].to_vec();
        let err = tm.migration_status(&truncated).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Sequence(SequenceError::UnknownVersion { version: 2 })
        ));
    }
}
