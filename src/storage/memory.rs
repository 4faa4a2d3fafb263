use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StorageError;

use super::row::{Row, RowQuery};

/// In-process storage backend.
///
/// Rows are keyed by `(table, id)`. An upsert replaces the stored row only
/// when its version is not older, which makes replays and out-of-order
/// retries harmless.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: DashMap<(String, String), Row>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        if row.id.is_empty() {
            return Err(StorageError::InvalidRow {
                table: table.to_string(),
                reason: "empty id".to_string(),
            });
        }

        match self.rows.entry((table.to_string(), row.id.clone())) {
            Entry::Occupied(mut stored) => {
                if row.version >= stored.get().version {
                    stored.insert(row.clone());
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(row.clone());
            }
        }

        Ok(())
    }

    /// Returns matching rows of the query's table, ordered by id.
    pub fn query(&self, query: &RowQuery) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == query.schema.table && query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        rows.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Number of rows stored in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.rows.iter().filter(|e| e.key().0 == table).count()
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.rows
            .get(&(table.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::row::{ColumnType, Filter, TableSchema, Value};

    const SCHEMA: TableSchema = TableSchema {
        table: "service_name",
        columns: &[("heartbeat_time", ColumnType::Int64)],
    };

    fn row(id: &str, version: i64) -> Row {
        Row::new(id.to_string(), version).with("heartbeat_time", Value::Int(version))
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let storage = MemoryStorage::new();
        storage.upsert("service_name", &row("7_A", 100)).expect("upsert");
        storage.upsert("service_name", &row("7_A", 150)).expect("upsert");
        storage.upsert("service_name", &row("7_A", 120)).expect("upsert");

        let stored = storage.get("service_name", "7_A").expect("row");
        assert_eq!(stored.version, 150);
        assert_eq!(storage.count("service_name"), 1);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let storage = MemoryStorage::new();
        let r = row("7_A", 100);
        storage.upsert("service_name", &r).expect("upsert");
        storage.upsert("service_name", &r).expect("upsert");

        assert_eq!(storage.count("service_name"), 1);
        assert_eq!(storage.get("service_name", "7_A"), Some(r));
    }

    #[test]
    fn test_rejects_empty_id() {
        let storage = MemoryStorage::new();
        let err = storage
            .upsert("service_name", &row("", 1))
            .expect_err("empty id");
        assert!(matches!(err, StorageError::InvalidRow { .. }));
        assert_eq!(storage.count("service_name"), 0);
    }

    #[test]
    fn test_query_scoped_to_table() {
        let storage = MemoryStorage::new();
        storage.upsert("service_name", &row("b", 10)).expect("upsert");
        storage.upsert("service_name", &row("a", 20)).expect("upsert");
        storage.upsert("other", &row("c", 30)).expect("upsert");

        let rows = storage.query(&RowQuery::new(SCHEMA));
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let rows = storage.query(
            &RowQuery::new(SCHEMA)
                .filter(Filter::AtLeast("heartbeat_time", 15))
                .limit(5),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
    }
}
