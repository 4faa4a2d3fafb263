use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::Row;

/// Element type flowing through a worker graph.
///
/// `id()` is both the aggregation key and the routing key: records with the
/// same id merge into one bucket and route to the same cluster member.
/// `merge` must be commutative and associative, since concurrent ingestion
/// interleaves arbitrarily.
pub trait StreamData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Identity of the record, derived from its identity fields.
    fn id(&self) -> String;

    /// Folds `other` into `self`.
    fn merge(&mut self, other: &Self);
}

/// Stream data that terminates in a storage table.
pub trait PersistenceData: StreamData {
    /// Target table name.
    const TABLE: &'static str;

    /// Monotonic timestamp used for last-write-wins upserts.
    fn version(&self) -> i64;

    /// Converts the record into the storage write model.
    fn to_row(&self) -> Row;
}
