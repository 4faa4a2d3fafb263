//! Storage collaborators: the row write model, backends and the async
//! writer that sits in front of them.

pub mod clickhouse;
pub mod memory;
pub mod row;
pub mod writer;

use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;

pub use clickhouse::ClickHouseStorage;
pub use memory::MemoryStorage;
pub use row::{ColumnType, Filter, Row, RowQuery, TableSchema, Value};
pub use writer::StorageWriter;

/// Storage backend, dispatched by enum rather than trait object.
pub enum Storage {
    Memory(Arc<MemoryStorage>),
    ClickHouse(ClickHouseStorage),
}

impl Storage {
    pub fn from_config(cfg: &StorageConfig) -> Self {
        match cfg.backend {
            StorageBackend::Memory => Self::Memory(Arc::new(MemoryStorage::new())),
            StorageBackend::ClickHouse => Self::ClickHouse(ClickHouseStorage::new(&cfg.clickhouse)),
        }
    }

    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::ClickHouse(_) => "clickhouse",
        }
    }

    /// Creates missing tables. The memory backend has nothing to do.
    pub async fn ensure_schema(&self, schemas: &[TableSchema]) -> Result<(), StorageError> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::ClickHouse(ch) => ch.ensure_schema(schemas).await,
        }
    }

    /// Idempotent last-write-wins upsert keyed by `row.id`.
    pub async fn upsert(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        match self {
            Self::Memory(m) => m.upsert(table, row),
            Self::ClickHouse(ch) => ch.upsert(table, row).await,
        }
    }

    pub async fn query(&self, query: &RowQuery) -> Result<Vec<Row>, StorageError> {
        match self {
            Self::Memory(m) => Ok(m.query(query)),
            Self::ClickHouse(ch) => ch.query(query).await,
        }
    }
}
