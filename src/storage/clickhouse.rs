use std::fmt::Write;

use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::error::StorageError;

use super::row::{ColumnType, Filter, Row, RowQuery, TableSchema, Value};

/// ClickHouse backend over the native TCP protocol.
///
/// Tables use `ReplacingMergeTree(version)` ordered by `id`, so repeated
/// upserts collapse to the newest version; reads use `FINAL`.
pub struct ClickHouseStorage {
    pool: Pool,
    database: String,
}

impl ClickHouseStorage {
    pub fn new(cfg: &ClickHouseConfig) -> Self {
        Self {
            pool: Pool::new(dsn(cfg)),
            database: cfg.database.clone(),
        }
    }

    /// Creates every table that does not exist yet.
    pub async fn ensure_schema(&self, schemas: &[TableSchema]) -> Result<(), StorageError> {
        let mut handle = self.pool.get_handle().await.map_err(backend)?;

        for schema in schemas {
            let sql = create_table_sql(&self.database, schema);
            handle.execute(sql.as_str()).await.map_err(backend)?;
            tracing::info!(table = schema.table, "ClickHouse table ensured");
        }

        Ok(())
    }

    pub async fn upsert(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        if row.id.is_empty() {
            return Err(StorageError::InvalidRow {
                table: table.to_string(),
                reason: "empty id".to_string(),
            });
        }

        let sql = insert_sql(&self.database, table, row);
        let mut handle = self.pool.get_handle().await.map_err(backend)?;
        handle.execute(sql.as_str()).await.map_err(backend)
    }

    pub async fn query(&self, query: &RowQuery) -> Result<Vec<Row>, StorageError> {
        let sql = select_sql(&self.database, query);
        let mut handle = self.pool.get_handle().await.map_err(backend)?;
        let block = handle.query(sql.as_str()).fetch_all().await.map_err(backend)?;

        let mut rows = Vec::with_capacity(block.row_count());
        for r in block.rows() {
            let id: String = r.get("id").map_err(backend)?;
            let version: i64 = r.get("version").map_err(backend)?;
            let mut row = Row::new(id, version);

            for &(column, ty) in query.schema.columns {
                let value = match ty {
                    ColumnType::Int32 => Value::Int(i64::from(r.get::<i32, _>(column).map_err(backend)?)),
                    ColumnType::Int64 => Value::Int(r.get::<i64, _>(column).map_err(backend)?),
                    ColumnType::String => Value::Str(r.get::<String, _>(column).map_err(backend)?),
                };
                row.columns.push((column, value));
            }

            rows.push(row);
        }

        Ok(rows)
    }
}

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Builds a clickhouse-rs TCP DSN.
fn dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();
    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }
    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn
}

fn column_sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Int32 => "Int32",
        ColumnType::Int64 => "Int64",
        ColumnType::String => "String",
    }
}

fn create_table_sql(database: &str, schema: &TableSchema) -> String {
    let mut sql = String::with_capacity(256);
    let _ = write!(
        sql,
        "CREATE TABLE IF NOT EXISTS {database}.{} (id String, version Int64",
        schema.table
    );
    for (column, ty) in schema.columns {
        let _ = write!(sql, ", {column} {}", column_sql_type(*ty));
    }
    sql.push_str(") ENGINE = ReplacingMergeTree(version) ORDER BY id");
    sql
}

fn insert_sql(database: &str, table: &str, row: &Row) -> String {
    let mut columns = String::from("id, version");
    let mut values = String::with_capacity(64 + row.columns.len() * 24);
    let _ = write!(values, "'{}', {}", escape_sql(&row.id), row.version);

    for (column, value) in &row.columns {
        let _ = write!(columns, ", {column}");
        values.push_str(", ");
        push_literal(&mut values, value);
    }

    format!("INSERT INTO {database}.{table} ({columns}) VALUES ({values})")
}

fn select_sql(database: &str, query: &RowQuery) -> String {
    let mut sql = String::from("SELECT id, version");
    for (column, _) in query.schema.columns {
        let _ = write!(sql, ", {column}");
    }
    let _ = write!(sql, " FROM {database}.{} FINAL", query.schema.table);

    for (idx, filter) in query.filters.iter().enumerate() {
        sql.push_str(if idx == 0 { " WHERE " } else { " AND " });
        match filter {
            Filter::Eq(column, value) => {
                let _ = write!(sql, "{column} = ");
                push_literal(&mut sql, value);
            }
            Filter::Contains(column, needle) => {
                let _ = write!(sql, "position({column}, '{}') > 0", escape_sql(needle));
            }
            Filter::AtLeast(column, bound) => {
                let _ = write!(sql, "{column} >= {bound}");
            }
            Filter::Below(column, bound) => {
                let _ = write!(sql, "{column} < {bound}");
            }
        }
    }

    sql.push_str(" ORDER BY id");
    if let Some(limit) = query.limit {
        let _ = write!(sql, " LIMIT {limit}");
    }
    sql
}

fn push_literal(out: &mut String, value: &Value) {
    match value {
        Value::Int(v) => {
            let _ = write!(out, "{v}");
        }
        Value::Str(v) => {
            let _ = write!(out, "'{}'", escape_sql(v));
        }
    }
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
