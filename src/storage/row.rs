use std::fmt;

/// A single column value in the storage write model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            Self::Int(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

/// Column type, used when reading rows back from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int32,
    Int64,
    String,
}

/// Table schema: ordered columns with their types.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub table: &'static str,
    pub columns: &'static [(&'static str, ColumnType)],
}

/// A row keyed by record identity with a last-write-wins version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: String,
    pub version: i64,
    pub columns: Vec<(&'static str, Value)>,
}

impl Row {
    pub fn new(id: String, version: i64) -> Self {
        Self {
            id,
            version,
            columns: Vec::with_capacity(8),
        }
    }

    /// Appends a column, builder-style.
    pub fn with(mut self, column: &'static str, value: Value) -> Self {
        self.columns.push((column, value));
        self
    }

    /// Returns a column value by name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }
}

/// Predicate on a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Column equals value.
    Eq(&'static str, Value),
    /// Column (string) contains the substring.
    Contains(&'static str, String),
    /// Column (int) is at least the value.
    AtLeast(&'static str, i64),
    /// Column (int) is strictly below the value.
    Below(&'static str, i64),
}

impl Filter {
    /// Evaluates the predicate against a row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, value) => row.get(column) == Some(value),
            Self::Contains(column, needle) => row
                .get_str(column)
                .is_some_and(|s| s.contains(needle.as_str())),
            Self::AtLeast(column, bound) => row.get_i64(column).is_some_and(|v| v >= *bound),
            Self::Below(column, bound) => row.get_i64(column).is_some_and(|v| v < *bound),
        }
    }
}

/// Read-path query: conjunction of filters, optional limit.
#[derive(Debug, Clone)]
pub struct RowQuery {
    pub schema: TableSchema,
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            filters: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Restricts `column` to the half-open range `[start, end)`.
    pub fn time_range(mut self, column: &'static str, start: i64, end: Option<i64>) -> Self {
        self.filters.push(Filter::AtLeast(column, start));
        if let Some(end) = end {
            self.filters.push(Filter::Below(column, end));
        }
        self
    }

    pub fn limit(mut self, top_n: usize) -> Self {
        self.limit = Some(top_n);
        self
    }

    /// Returns true when every filter accepts the row.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}
