//! Declarative migration steps and the persisted record of applied steps.
//!
//! A [`Migration`] is a versioned list of [`SchemaOp`]s. Its checksum is a
//! SHA-256 over a canonical encoding of the version and operations, so any
//! edit to an already-applied step is detected on the next run.
//!
//! [`plan`] compares a declared sequence with the applied [`MigrationRecord`]s
//! and decides which steps are pending. It is pure: the server's migration
//! runner does the I/O.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::Model;

/// Name of the reserved table holding [`MigrationRecord`]s.
pub const MIGRATIONS_TABLE: &str = "_schema_migrations";

// ---------------------------------------------------------------------------
// SchemaOp
// ---------------------------------------------------------------------------

/// A single change applied inside a migration step's transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOp {
    /// Create an empty table. Fails if the table already exists.
    CreateTable { table: String },
    /// Drop a table and all of its rows.
    DropTable { table: String },
    /// Write a seed row, replacing any existing value.
    Put {
        table: String,
        key: String,
        value: serde_json::Value,
    },
    /// Remove a row if present.
    Delete { table: String, key: String },
}

impl SchemaOp {
    /// Feeds a canonical, unambiguous encoding of this op into `hasher`.
    ///
    /// Every field is length-prefixed. `serde_json::Value` renders objects with
    /// sorted keys, so its `Display` output is stable.
    fn digest_into(&self, hasher: &mut Sha256) {
        fn field(hasher: &mut Sha256, s: &str) {
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }

        match self {
            Self::CreateTable { table } => {
                field(hasher, "create_table");
                field(hasher, table);
            }
            Self::DropTable { table } => {
                field(hasher, "drop_table");
                field(hasher, table);
            }
            Self::Put { table, key, value } => {
                field(hasher, "put");
                field(hasher, table);
                field(hasher, key);
                field(hasher, &value.to_string());
            }
            Self::Delete { table, key } => {
                field(hasher, "delete");
                field(hasher, table);
                field(hasher, key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

/// One versioned step of the declared migration sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    version: u64,
    name: String,
    ops: Vec<SchemaOp>,
}

impl Migration {
    /// Creates an empty step. Add operations with the builder methods.
    #[must_use]
    pub fn new(version: u64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            ops: Vec::new(),
        }
    }

    #[must_use]
    pub fn create_table(mut self, table: impl Into<String>) -> Self {
        self.ops.push(SchemaOp::CreateTable {
            table: table.into(),
        });
        self
    }

    #[must_use]
    pub fn drop_table(mut self, table: impl Into<String>) -> Self {
        self.ops.push(SchemaOp::DropTable {
            table: table.into(),
        });
        self
    }

    #[must_use]
    pub fn put(
        mut self,
        table: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.ops.push(SchemaOp::Put {
            table: table.into(),
            key: key.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn delete(mut self, table: impl Into<String>, key: impl Into<String>) -> Self {
        self.ops.push(SchemaOp::Delete {
            table: table.into(),
            key: key.into(),
        });
        self
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ops(&self) -> &[SchemaOp] {
        &self.ops
    }

    /// Hex-encoded SHA-256 over the version and operations.
    ///
    /// The name is deliberately excluded: renaming a step does not change
    /// what it did to the schema.
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update((self.ops.len() as u64).to_le_bytes());
        for op in &self.ops {
            op.digest_into(&mut hasher);
        }
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// MigrationRecord
// ---------------------------------------------------------------------------

/// Persisted evidence that a step was applied. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u64,
    pub name: String,
    pub checksum: String,
    /// Wall-clock millis since epoch at commit time.
    pub applied_at_ms: i64,
}

impl MigrationRecord {
    /// Storage key for a version. Zero-padded so lexical order is version order.
    #[must_use]
    pub fn key_for(version: u64) -> String {
        format!("{version:020}")
    }
}

impl Model for MigrationRecord {
    const TABLE: &'static str = MIGRATIONS_TABLE;

    fn key(&self) -> String {
        Self::key_for(self.version)
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Why a declared sequence cannot be reconciled with the applied records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("migration versions must be strictly increasing: {version} follows {previous}")]
    NotIncreasing { previous: u64, version: u64 },
    #[error("applied migrations are not a prefix of the declared sequence: expected version {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("applied migration {version} is not declared")]
    UnknownVersion { version: u64 },
    #[error("checksum mismatch for migration {version}: declared {declared}, applied {applied}")]
    ChecksumMismatch {
        version: u64,
        declared: String,
        applied: String,
    },
}

/// Outcome of comparing a declared sequence with applied records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Highest applied version, `None` on a fresh store.
    pub current_version: Option<u64>,
    /// Index into the declared sequence of the first pending step.
    /// Every step from here to the end is pending.
    pub first_pending: usize,
    /// Versions still to apply, in order.
    pub pending: Vec<u64>,
}

/// Checks that `declared` is strictly increasing by version.
///
/// # Errors
///
/// Returns [`SequenceError::NotIncreasing`] at the first violation.
pub fn validate_sequence(declared: &[Migration]) -> Result<(), SequenceError> {
    for pair in declared.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(SequenceError::NotIncreasing {
                previous: pair[0].version,
                version: pair[1].version,
            });
        }
    }
    Ok(())
}

/// Decides which declared steps are pending given the applied records.
///
/// `applied` must be sorted by version. The applied versions must form a
/// prefix of the declared sequence, with matching checksums.
///
/// # Errors
///
/// Returns a [`SequenceError`] if the sequence is malformed, if applied
/// records skip or reorder declared steps, if a record has no declared
/// counterpart, or if an applied step's content changed.
pub fn plan(
    declared: &[Migration],
    applied: &[MigrationRecord],
) -> Result<MigrationPlan, SequenceError> {
    validate_sequence(declared)?;

    for (idx, record) in applied.iter().enumerate() {
        let Some(step) = declared.get(idx) else {
            return Err(SequenceError::UnknownVersion {
                version: record.version,
            });
        };
        if step.version != record.version {
            return if declared.iter().any(|m| m.version == record.version) {
                Err(SequenceError::OutOfOrder {
                    expected: step.version,
                    found: record.version,
                })
            } else {
                Err(SequenceError::UnknownVersion {
                    version: record.version,
                })
            };
        }
        let declared_checksum = step.checksum();
        if declared_checksum != record.checksum {
            return Err(SequenceError::ChecksumMismatch {
                version: record.version,
                declared: declared_checksum,
                applied: record.checksum.clone(),
            });
        }
    }

    let first_pending = applied.len();
    Ok(MigrationPlan {
        current_version: applied.last().map(|r| r.version),
        first_pending,
        pending: declared[first_pending..].iter().map(Migration::version).collect(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn sequence() -> Vec<Migration> {
        vec![
            Migration::new(1, "create notes").create_table("notes"),
            Migration::new(2, "seed notes").put("notes", "welcome", json!({"body": "hi"})),
            Migration::new(3, "create tags").create_table("tags"),
        ]
    }

    fn record_of(m: &Migration) -> MigrationRecord {
        MigrationRecord {
            version: m.version(),
            name: m.name().to_string(),
            checksum: m.checksum(),
            applied_at_ms: 0,
        }
    }

    #[test]
    fn checksum_is_stable_and_ignores_name() {
        let a = Migration::new(7, "a").create_table("t");
        let b = Migration::new(7, "renamed").create_table("t");
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn checksum_changes_with_content() {
        let a = Migration::new(1, "x").put("t", "k", json!({"n": 1}));
        let b = Migration::new(1, "x").put("t", "k", json!({"n": 2}));
        let c = Migration::new(2, "x").put("t", "k", json!({"n": 1}));
        assert_ne!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn checksum_ignores_json_key_order() {
        let a = Migration::new(1, "x").put("t", "k", json!({"a": 1, "b": 2}));
        let b = Migration::new(1, "x").put("t", "k", json!({"b": 2, "a": 1}));
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn record_keys_sort_by_version() {
        let mut keys = [
            MigrationRecord::key_for(10),
            MigrationRecord::key_for(2),
            MigrationRecord::key_for(1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            [
                MigrationRecord::key_for(1),
                MigrationRecord::key_for(2),
                MigrationRecord::key_for(10)
            ]
        );
    }

    #[test]
    fn fresh_store_has_everything_pending() {
        let plan = plan(&sequence(), &[]).unwrap();
        assert_eq!(plan.current_version, None);
        assert_eq!(plan.first_pending, 0);
        assert_eq!(plan.pending, vec![1, 2, 3]);
    }

    #[test]
    fn applied_prefix_leaves_suffix_pending() {
        let declared = sequence();
        let applied = vec![record_of(&declared[0]), record_of(&declared[1])];
        let plan = plan(&declared, &applied).unwrap();
        assert_eq!(plan.current_version, Some(2));
        assert_eq!(plan.pending, vec![3]);
    }

    #[test]
    fn fully_applied_has_nothing_pending() {
        let declared = sequence();
        let applied: Vec<_> = declared.iter().map(record_of).collect();
        let plan = plan(&declared, &applied).unwrap();
        assert_eq!(plan.current_version, Some(3));
        assert!(plan.pending.is_empty());
    }

    #[test]
    fn non_increasing_sequence_is_rejected() {
        let declared = vec![
            Migration::new(2, "b").create_table("b"),
            Migration::new(1, "a").create_table("a"),
        ];
        assert_eq!(
            validate_sequence(&declared),
            Err(SequenceError::NotIncreasing {
                previous: 2,
                version: 1
            })
        );
    }

    #[test]
    fn gap_in_applied_records_is_out_of_order() {
        let declared = sequence();
        let applied = vec![record_of(&declared[0]), record_of(&declared[2])];
        assert_eq!(
            plan(&declared, &applied),
            Err(SequenceError::OutOfOrder {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn undeclared_applied_version_is_unknown() {
        let declared = sequence();
        let mut applied: Vec<_> = declared.iter().map(record_of).collect();
        applied.push(MigrationRecord {
            version: 4,
            name: "future".to_string(),
            checksum: String::new(),
            applied_at_ms: 0,
        });
        assert_eq!(
            plan(&declared, &applied),
            Err(SequenceError::UnknownVersion { version: 4 })
        );
    }

    #[test]
    fn edited_applied_step_is_a_checksum_mismatch() {
        let declared = sequence();
        let mut tampered = record_of(&declared[0]);
        tampered.checksum = "00".repeat(32);
        let err = plan(&declared, &[tampered]).unwrap_err();
        assert!(matches!(err, SequenceError::ChecksumMismatch { version: 1, .. }));
    }

    proptest! {
        #[test]
        fn any_applied_prefix_plans_the_remaining_suffix(len in 0usize..8, applied_len in 0usize..8) {
            let declared: Vec<Migration> = (1..=len as u64)
                .map(|v| Migration::new(v, format!("step {v}")).create_table(format!("t{v}")))
                .collect();
            let applied_len = applied_len.min(len);
            let applied: Vec<_> = declared[..applied_len].iter().map(record_of).collect();

            let plan = plan(&declared, &applied).unwrap();
            prop_assert_eq!(plan.first_pending, applied_len);
            prop_assert_eq!(plan.pending.len(), len - applied_len);
            prop_assert_eq!(plan.current_version, applied.last().map(|r| r.version));
        }
    }
}
