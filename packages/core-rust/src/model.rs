//! Plain stored records.
//!
//! A [`Model`] is data only: it names its table and derives its key. All
//! reads and writes go through a transaction on the server side, never
//! through methods on the record itself.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record type persisted in a single table, addressed by a string key.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table holding every record of this type.
    const TABLE: &'static str;

    /// Primary key of this record within [`Model::TABLE`].
    fn key(&self) -> String;
}
