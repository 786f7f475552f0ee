use async_trait::async_trait;
use duplex_core::{
    error::{BackendError, DuplexError, Result},
    traits::{BackendResult, SecondaryStore},
    types::{ColumnValue, Predicate, Row, RowMutation},
};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SqliteConfig, SynchronousMode};
use crate::schema::{self, backend_error, quote_ident, ColumnKind, ColumnKinds};

/// SQLite-backed secondary store
///
/// One table per collection, created lazily on first write. Attribute columns
/// are added as they first appear. NULL cells are omitted when reading rows
/// back, so an attribute explicitly set to null reads as absent.
///
/// All SQLite work runs on the blocking pool; the async methods only hand it
/// off and wait. Raw `Predicate::Sql` clauses see cells of mixed-type columns
/// in their tagged blob form.
pub struct SqliteSecondaryStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Arc<Mutex<Connection>>,
    columns: Mutex<HashMap<String, ColumnKinds>>,
}

impl SqliteSecondaryStore {
    pub fn open(cfg: SqliteConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            &cfg.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| DuplexError::Config(e.to_string()))?;

        Self::configure_connection(&conn, &cfg)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, handy for tests and embedding.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| DuplexError::Config(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::init_meta(&conn).map_err(|e| DuplexError::Backend(backend_error(e)))?;
        tracing::info!("SQLite secondary store ready");
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Arc::new(Mutex::new(conn)),
                columns: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Shared connection, e.g. for a [`SqliteCheckpointStore`](crate::SqliteCheckpointStore)
    /// living in the same database file.
    pub fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.inner.conn
    }

    fn configure_connection(conn: &Connection, cfg: &SqliteConfig) -> Result<()> {
        if cfg.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| DuplexError::Config(e.to_string()))?;
        }

        let sync_mode = match cfg.synchronous {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Off => "OFF",
        };
        conn.pragma_update(None, "synchronous", sync_mode)
            .map_err(|e| DuplexError::Config(e.to_string()))?;

        conn.pragma_update(None, "cache_size", cfg.cache_size)
            .map_err(|e| DuplexError::Config(e.to_string()))?;

        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
            .map_err(|e| DuplexError::Config(e.to_string()))?;

        Ok(())
    }

    /// Run `work` on the blocking pool so lock waits and `busy_timeout`
    /// never stall the runtime.
    async fn blocking<T, F>(&self, work: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> BackendResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || work(&inner))
            .await
            .map_err(|e| BackendError::unavailable(format!("sqlite task failed: {e}")))?
    }
}

fn check_table(table: &str) -> BackendResult<()> {
    if schema::is_reserved(table) {
        return Err(BackendError::rejected(format!(
            "table name '{table}' is reserved by the secondary store"
        )));
    }
    Ok(())
}

fn kind_of(kinds: &ColumnKinds, column: &str) -> ColumnKind {
    kinds.get(column).copied().unwrap_or(ColumnKind::Any)
}

impl Inner {
    fn kinds_for(&self, conn: &Connection, table: &str) -> BackendResult<ColumnKinds> {
        if let Some(kinds) = self.columns.lock().get(table) {
            return Ok(kinds.clone());
        }
        let kinds = schema::load_columns(conn, table).map_err(backend_error)?;
        if !kinds.is_empty() {
            self.columns.lock().insert(table.to_string(), kinds.clone());
        }
        Ok(kinds)
    }

    fn upsert(&self, row: &Row, id_column: &str) -> BackendResult<()> {
        check_table(&row.table)?;
        match row.get(id_column) {
            Some(ColumnValue::Text(_)) => {}
            _ => {
                return Err(BackendError::rejected(format!(
                    "row for table {} has no text {} column",
                    row.table, id_column
                )))
            }
        }

        let mut conn = self.conn.lock();
        let mut kinds = self.kinds_for(&conn, &row.table)?;

        let tx = conn.transaction().map_err(backend_error)?;
        if kinds.is_empty() {
            schema::create_table(&tx, &row.table, id_column).map_err(backend_error)?;
            kinds.insert(id_column.to_string(), ColumnKind::Any);
        }
        for (name, value) in &row.columns {
            let Some(current) = kinds.get(name).copied() else {
                let kind = schema::add_column(&tx, &row.table, name, value).map_err(backend_error)?;
                kinds.insert(name.clone(), kind);
                continue;
            };
            let next = current.widen(value);
            if next != current {
                if next == ColumnKind::Tagged {
                    schema::retag_column(&tx, &row.table, name, current)?;
                } else {
                    schema::set_kind(&tx, &row.table, name, next).map_err(backend_error)?;
                }
                kinds.insert(name.clone(), next);
            }
        }

        let names = row
            .columns
            .iter()
            .map(|(n, _)| quote_ident(n))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=row.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(&row.table),
            names,
            placeholders
        );
        let values: Vec<Value> = row
            .columns
            .iter()
            .map(|(n, v)| schema::to_sql(v, kind_of(&kinds, n)))
            .collect();
        tx.execute(&sql, params_from_iter(values.iter()))
            .map_err(backend_error)?;
        tx.commit().map_err(backend_error)?;

        // Only cache layout changes that actually committed
        self.columns.lock().insert(row.table.clone(), kinds);
        Ok(())
    }

    fn delete(&self, table: &str, id_column: &str, id: &str) -> BackendResult<()> {
        check_table(table)?;
        let conn = self.conn.lock();
        if !schema::table_exists(&conn, table).map_err(backend_error)? {
            return Ok(());
        }
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(table),
                quote_ident(id_column)
            ),
            [id],
        )
        .map_err(backend_error)?;
        Ok(())
    }

    fn query(&self, table: &str, predicate: &Predicate) -> BackendResult<Vec<Row>> {
        // Column 1 is always the primary key
        match predicate {
            Predicate::All => self.select(table, "ORDER BY 1", |_| Vec::new()),
            Predicate::Eq { column, value } => self.select(
                table,
                &format!("WHERE {} = ?1 ORDER BY 1", quote_ident(column)),
                |kinds| vec![schema::to_sql(value, kind_of(kinds, column))],
            ),
            Predicate::Sql { clause, params } => {
                self.select(table, &format!("WHERE {clause} ORDER BY 1"), |_| {
                    params
                        .iter()
                        .map(|v| schema::to_sql(v, ColumnKind::Any))
                        .collect()
                })
            }
        }
    }

    fn list_page(
        &self,
        table: &str,
        id_column: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Row>> {
        let limit = Value::Integer(page_size.min(i64::MAX as usize) as i64);
        let id = quote_ident(id_column);
        match after_id {
            Some(after) => self.select(
                table,
                &format!("WHERE {id} > ?1 ORDER BY {id} LIMIT ?2"),
                |_| vec![Value::Text(after.to_string()), limit.clone()],
            ),
            None => self.select(table, &format!("ORDER BY {id} LIMIT ?1"), |_| {
                vec![limit.clone()]
            }),
        }
    }

    /// `SELECT *` with `where_sql`, binding the parameters built from the
    /// table's column kinds.
    fn select<F>(&self, table: &str, where_sql: &str, bind: F) -> BackendResult<Vec<Row>>
    where
        F: FnOnce(&ColumnKinds) -> Vec<Value>,
    {
        check_table(table)?;
        let conn = self.conn.lock();
        if !schema::table_exists(&conn, table).map_err(backend_error)? {
            return Ok(Vec::new());
        }
        let kinds = self.kinds_for(&conn, table)?;
        let params = bind(&kinds);
        let sql = format!("SELECT * FROM {} {}", quote_ident(table), where_sql);

        let mut stmt = conn.prepare(&sql).map_err(backend_error)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(backend_error)?;

        let mut out = Vec::new();
        while let Some(r) = rows.next().map_err(backend_error)? {
            let mut row = Row::new(table);
            for (i, name) in names.iter().enumerate() {
                let raw = r.get_ref(i).map_err(backend_error)?;
                let value = schema::from_sql(raw, kind_of(&kinds, name))?;
                if !value.is_null() {
                    row.columns.push((name.clone(), value));
                }
            }
            out.push(row);
        }
        Ok(out)
    }
}

#[async_trait]
impl SecondaryStore for SqliteSecondaryStore {
    async fn execute_row(&self, mutation: &RowMutation) -> BackendResult<()> {
        let mutation = mutation.clone();
        self.blocking(move |inner| match &mutation {
            RowMutation::Upsert { row, id_column } => inner.upsert(row, id_column),
            RowMutation::Delete {
                table,
                id_column,
                id,
            } => inner.delete(table, id_column, id),
        })
        .await
    }

    async fn query(&self, table: &str, predicate: &Predicate) -> BackendResult<Vec<Row>> {
        let table = table.to_string();
        let predicate = predicate.clone();
        self.blocking(move |inner| inner.query(&table, &predicate))
            .await
    }

    async fn list_page(
        &self,
        table: &str,
        id_column: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Row>> {
        let table = table.to_string();
        let id_column = id_column.to_string();
        let after_id = after_id.map(str::to_string);
        self.blocking(move |inner| {
            inner.list_page(&table, &id_column, after_id.as_deref(), page_size)
        })
        .await
    }
}
