use serde::{Deserialize, Serialize};

/// A single relational cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    /// Opaque serialized payload. The schema translator uses it for nested
    /// values the relational side cannot model natively.
    Blob(Vec<u8>),
}

impl ColumnValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

impl From<&str> for ColumnValue {
    fn from(s: &str) -> Self {
        ColumnValue::Text(s.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(s: String) -> Self {
        ColumnValue::Text(s)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Integer(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

/// Relational representation of a record.
///
/// The collection is implied by `table`; it is never stored as a column.
/// Columns keep the order they were produced in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub table: String,
    pub columns: Vec<(String, ColumnValue)>,
}

impl Row {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a column value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ColumnValue>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }
}

/// A single row-level write against the secondary store.
#[derive(Debug, Clone, PartialEq)]
pub enum RowMutation {
    /// Insert or replace the row keyed by `id_column`.
    Upsert { row: Row, id_column: String },
    /// Hard delete. Deleting an absent row succeeds.
    Delete {
        table: String,
        id_column: String,
        id: String,
    },
}

impl RowMutation {
    pub fn table(&self) -> &str {
        match self {
            RowMutation::Upsert { row, .. } => &row.table,
            RowMutation::Delete { table, .. } => table,
        }
    }
}

/// Compiled secondary-store predicate.
///
/// Produced by the external query compiler; this crate never parses it.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Eq { column: String, value: ColumnValue },
    /// Native SQL `WHERE` body with positional parameters.
    Sql {
        clause: String,
        params: Vec<ColumnValue>,
    },
}
