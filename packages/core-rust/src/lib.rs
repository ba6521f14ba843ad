//! `Harbor` Core: migration steps, applied-migration records, and the stored-record model.

pub mod migration;
pub mod model;

pub use migration::{
    plan, validate_sequence, Migration, MigrationPlan, MigrationRecord, SchemaOp, SequenceError,
    MIGRATIONS_TABLE,
};
pub use model::Model;
