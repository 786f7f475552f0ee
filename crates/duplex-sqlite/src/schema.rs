//! Dynamic table layout for the secondary store.
//!
//! Tables are created on first write with only the primary-key column.
//! Attribute columns are added as they first appear and carry no declared
//! type, so SQLite stores every value exactly as bound. Each column has a
//! kind recorded in `duplex_columns`, since SQLite has no boolean storage
//! class:
//!
//! - `unset`: only nulls seen so far
//! - `bool`: booleans, stored as 0/1
//! - `any`: anything but booleans, stored natively
//! - `tagged`: mixed booleans and non-booleans; every cell is a blob with a
//!   leading type tag
//!
//! The kind is fixed by the first non-null value. A column that later sees a
//! value of the other family is retagged in place, so a cell always decodes
//! to the value that was written.

use duplex_core::{BackendError, BackendErrorKind, ColumnValue};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;

pub const COLUMNS_TABLE: &str = "duplex_columns";
pub const CHECKPOINT_TABLE: &str = "duplex_reconcile_checkpoint";

const TAG_BOOL: u8 = b'b';
const TAG_INTEGER: u8 = b'i';
const TAG_REAL: u8 = b'r';
const TAG_TEXT: u8 = b't';
const TAG_BLOB: u8 = b'x';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Unset,
    Bool,
    Any,
    Tagged,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Unset => "unset",
            ColumnKind::Bool => "bool",
            ColumnKind::Any => "any",
            ColumnKind::Tagged => "tagged",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "unset" => ColumnKind::Unset,
            "bool" => ColumnKind::Bool,
            "tagged" => ColumnKind::Tagged,
            _ => ColumnKind::Any,
        }
    }

    /// Kind a column must have to hold `value` alongside what it already holds.
    pub fn widen(self, value: &ColumnValue) -> Self {
        let wanted = match value {
            ColumnValue::Null => return self,
            ColumnValue::Bool(_) => ColumnKind::Bool,
            _ => ColumnKind::Any,
        };
        match self {
            ColumnKind::Unset => wanted,
            ColumnKind::Tagged => ColumnKind::Tagged,
            current if current == wanted => current,
            _ => ColumnKind::Tagged,
        }
    }
}

/// Column name -> kind
pub type ColumnKinds = HashMap<String, ColumnKind>;

/// Whether `table` belongs to the adapter or to SQLite itself.
pub fn is_reserved(table: &str) -> bool {
    table == COLUMNS_TABLE
        || table == CHECKPOINT_TABLE
        || table.to_ascii_lowercase().starts_with("sqlite_")
}

pub fn init_meta(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS duplex_columns (
            table_name TEXT NOT NULL,
            column_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            PRIMARY KEY (table_name, column_name)
        )",
        [],
    )?;
    Ok(())
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn create_table(conn: &Connection, table: &str, id_column: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY NOT NULL)",
            quote_ident(table),
            quote_ident(id_column)
        ),
        [],
    )?;
    set_kind(conn, table, id_column, ColumnKind::Any)
}

/// Load the known columns of `table` from the metadata table.
pub fn load_columns(conn: &Connection, table: &str) -> rusqlite::Result<ColumnKinds> {
    let mut stmt =
        conn.prepare("SELECT column_name, kind FROM duplex_columns WHERE table_name = ?1")?;
    let rows = stmt.query_map([table], |row| {
        let kind: String = row.get(1)?;
        Ok((row.get(0)?, ColumnKind::parse(&kind)))
    })?;
    let kinds = rows.collect::<rusqlite::Result<ColumnKinds>>()?;
    Ok(kinds)
}

/// Add `column` to `table`, with its kind fixed by `value` unless null.
pub fn add_column(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &ColumnValue,
) -> rusqlite::Result<ColumnKind> {
    let kind = ColumnKind::Unset.widen(value);
    conn.execute(
        &format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            quote_ident(column)
        ),
        [],
    )?;
    set_kind(conn, table, column, kind)?;
    tracing::debug!(table, column, kind = kind.as_str(), "Added secondary column");
    Ok(kind)
}

pub fn set_kind(
    conn: &Connection,
    table: &str,
    column: &str,
    kind: ColumnKind,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO duplex_columns (table_name, column_name, kind) VALUES (?1, ?2, ?3)",
        params![table, column, kind.as_str()],
    )?;
    Ok(())
}

/// Rewrite every non-null cell of `column` from `from` encoding to tagged.
pub fn retag_column(
    conn: &Connection,
    table: &str,
    column: &str,
    from: ColumnKind,
) -> Result<(), BackendError> {
    let cells: Vec<(i64, ColumnValue)> = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT rowid, {col} FROM {tbl} WHERE {col} IS NOT NULL",
                col = quote_ident(column),
                tbl = quote_ident(table)
            ))
            .map_err(backend_error)?;
        let mut rows = stmt.query([]).map_err(backend_error)?;
        let mut cells = Vec::new();
        while let Some(row) = rows.next().map_err(backend_error)? {
            let rowid: i64 = row.get(0).map_err(backend_error)?;
            let raw = row.get_ref(1).map_err(backend_error)?;
            cells.push((rowid, from_sql(raw, from)?));
        }
        cells
    };

    let update = format!(
        "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
        quote_ident(table),
        quote_ident(column)
    );
    for (rowid, value) in &cells {
        conn.execute(&update, params![to_sql(value, ColumnKind::Tagged), rowid])
            .map_err(backend_error)?;
    }
    set_kind(conn, table, column, ColumnKind::Tagged).map_err(backend_error)?;
    tracing::debug!(
        table,
        column,
        cells = cells.len(),
        "Retagged mixed-type secondary column"
    );
    Ok(())
}

/// Bind `value` for a column of `kind`.
pub fn to_sql(value: &ColumnValue, kind: ColumnKind) -> Value {
    if kind == ColumnKind::Tagged && !value.is_null() {
        return Value::Blob(encode_tagged(value));
    }
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Bool(b) => Value::Integer(i64::from(*b)),
        ColumnValue::Integer(i) => Value::Integer(*i),
        ColumnValue::Real(f) => Value::Real(*f),
        ColumnValue::Text(s) => Value::Text(s.clone()),
        ColumnValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn encode_tagged(value: &ColumnValue) -> Vec<u8> {
    let (tag, body) = match value {
        ColumnValue::Null => return Vec::new(),
        ColumnValue::Bool(b) => (TAG_BOOL, vec![u8::from(*b)]),
        ColumnValue::Integer(i) => (TAG_INTEGER, i.to_le_bytes().to_vec()),
        ColumnValue::Real(f) => (TAG_REAL, f.to_bits().to_le_bytes().to_vec()),
        ColumnValue::Text(s) => (TAG_TEXT, s.as_bytes().to_vec()),
        ColumnValue::Blob(b) => (TAG_BLOB, b.clone()),
    };
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(tag);
    out.extend_from_slice(&body);
    out
}

fn decode_tagged(bytes: &[u8]) -> Result<ColumnValue, BackendError> {
    let malformed = || BackendError::rejected("malformed tagged cell");
    let (tag, body) = bytes.split_first().ok_or_else(malformed)?;
    let word = || -> Result<[u8; 8], BackendError> { body.try_into().map_err(|_| malformed()) };
    Ok(match *tag {
        TAG_BOOL => match body {
            [0] => ColumnValue::Bool(false),
            [1] => ColumnValue::Bool(true),
            _ => return Err(malformed()),
        },
        TAG_INTEGER => ColumnValue::Integer(i64::from_le_bytes(word()?)),
        TAG_REAL => ColumnValue::Real(f64::from_bits(u64::from_le_bytes(word()?))),
        TAG_TEXT => ColumnValue::Text(
            std::str::from_utf8(body)
                .map_err(|e| BackendError::rejected(format!("invalid utf-8 in tagged cell: {e}")))?
                .to_string(),
        ),
        TAG_BLOB => ColumnValue::Blob(body.to_vec()),
        _ => return Err(malformed()),
    })
}

pub fn from_sql(value: ValueRef<'_>, kind: ColumnKind) -> Result<ColumnValue, BackendError> {
    Ok(match value {
        ValueRef::Null => ColumnValue::Null,
        ValueRef::Blob(b) if kind == ColumnKind::Tagged => decode_tagged(b)?,
        ValueRef::Integer(i) if kind == ColumnKind::Bool && (i == 0 || i == 1) => {
            ColumnValue::Bool(i == 1)
        }
        ValueRef::Integer(i) => ColumnValue::Integer(i),
        ValueRef::Real(f) => ColumnValue::Real(f),
        ValueRef::Text(t) => ColumnValue::Text(
            std::str::from_utf8(t)
                .map_err(|e| BackendError::rejected(format!("invalid utf-8 in text column: {e}")))?
                .to_string(),
        ),
        ValueRef::Blob(b) => ColumnValue::Blob(b.to_vec()),
    })
}

/// Map a SQLite error onto the adapter error taxonomy.
pub fn backend_error(err: rusqlite::Error) -> BackendError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            BackendErrorKind::Transient
        }
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::CannotOpen => {
            BackendErrorKind::Unavailable
        }
        _ => BackendErrorKind::Rejected,
    };
    BackendError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_bool_only_decoded_for_bool_columns() {
        assert_eq!(
            from_sql(ValueRef::Integer(1), ColumnKind::Bool).unwrap(),
            ColumnValue::Bool(true)
        );
        assert_eq!(
            from_sql(ValueRef::Integer(1), ColumnKind::Any).unwrap(),
            ColumnValue::Integer(1)
        );
        assert_eq!(
            from_sql(ValueRef::Integer(7), ColumnKind::Bool).unwrap(),
            ColumnValue::Integer(7)
        );
    }

    #[test]
    fn test_kind_fixed_by_first_non_null_value() {
        use ColumnKind::*;
        assert_eq!(Unset.widen(&ColumnValue::Null), Unset);
        assert_eq!(Unset.widen(&ColumnValue::Bool(true)), Bool);
        assert_eq!(Unset.widen(&ColumnValue::Integer(1)), Any);
        assert_eq!(Bool.widen(&ColumnValue::Null), Bool);
        assert_eq!(Bool.widen(&ColumnValue::Bool(false)), Bool);
        assert_eq!(Bool.widen(&ColumnValue::Integer(1)), Tagged);
        assert_eq!(Any.widen(&ColumnValue::Text("x".into())), Any);
        assert_eq!(Any.widen(&ColumnValue::Bool(true)), Tagged);
        assert_eq!(Tagged.widen(&ColumnValue::Integer(1)), Tagged);
    }

    #[test]
    fn test_tagged_cells_decode_exactly() {
        let values = [
            ColumnValue::Bool(true),
            ColumnValue::Bool(false),
            ColumnValue::Integer(1),
            ColumnValue::Integer(-42),
            ColumnValue::Real(2.5),
            ColumnValue::Text("true".into()),
            ColumnValue::Blob(vec![b'b', 1]),
        ];
        for value in values {
            let Value::Blob(bytes) = to_sql(&value, ColumnKind::Tagged) else {
                panic!("tagged cell should be a blob");
            };
            assert_eq!(
                from_sql(ValueRef::Blob(&bytes), ColumnKind::Tagged).unwrap(),
                value
            );
        }
        assert_eq!(to_sql(&ColumnValue::Null, ColumnKind::Tagged), Value::Null);
        assert!(from_sql(ValueRef::Blob(b"i12"), ColumnKind::Tagged).is_err());
    }

    #[test]
    fn test_add_column_records_kind() {
        let conn = Connection::open_in_memory().unwrap();
        init_meta(&conn).unwrap();
        create_table(&conn, "users", "id").unwrap();
        add_column(&conn, "users", "active", &ColumnValue::Bool(true)).unwrap();
        add_column(&conn, "users", "name", &ColumnValue::Text("a".into())).unwrap();
        add_column(&conn, "users", "nickname", &ColumnValue::Null).unwrap();

        let kinds = load_columns(&conn, "users").unwrap();
        assert_eq!(kinds.get("active"), Some(&ColumnKind::Bool));
        assert_eq!(kinds.get("name"), Some(&ColumnKind::Any));
        assert_eq!(kinds.get("nickname"), Some(&ColumnKind::Unset));
        assert!(kinds.contains_key("id"));
        assert!(table_exists(&conn, "users").unwrap());
        assert!(!table_exists(&conn, "orders").unwrap());
    }

    #[test]
    fn test_retag_rewrites_existing_cells() {
        let conn = Connection::open_in_memory().unwrap();
        init_meta(&conn).unwrap();
        create_table(&conn, "t", "id").unwrap();
        add_column(&conn, "t", "v", &ColumnValue::Bool(true)).unwrap();
        conn.execute("INSERT INTO t (id, v) VALUES ('a', 1), ('b', NULL)", [])
            .unwrap();

        retag_column(&conn, "t", "v", ColumnKind::Bool).unwrap();

        let raw: Vec<u8> = conn
            .query_row("SELECT v FROM t WHERE id = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(
            from_sql(ValueRef::Blob(&raw), ColumnKind::Tagged).unwrap(),
            ColumnValue::Bool(true)
        );
        let missing: Option<Vec<u8>> = conn
            .query_row("SELECT v FROM t WHERE id = 'b'", [], |r| r.get(0))
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(
            load_columns(&conn, "t").unwrap().get("v"),
            Some(&ColumnKind::Tagged)
        );
    }

    #[test]
    fn test_reserved_tables() {
        assert!(is_reserved(COLUMNS_TABLE));
        assert!(is_reserved(CHECKPOINT_TABLE));
        assert!(is_reserved("sqlite_sequence"));
        assert!(!is_reserved("users"));
    }
}
