use chrono::{DateTime, Utc};
use duplex_core::{
    error::{DuplexError, Result},
    traits::CheckpointStore,
    types::ReconcileCheckpoint,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use crate::schema::backend_error;

/// Durable reconciler checkpoints in a `duplex_reconcile_checkpoint` table
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Create the checkpoint table on `conn` if needed.
    ///
    /// Pass [`SqliteSecondaryStore::conn`](crate::SqliteSecondaryStore::conn)
    /// to keep checkpoints next to the relational data.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS duplex_reconcile_checkpoint (
                    collection TEXT PRIMARY KEY,
                    last_id TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .map_err(sql_err)?;
        Ok(Self { conn })
    }
}

fn sql_err(e: rusqlite::Error) -> DuplexError {
    DuplexError::Backend(backend_error(e))
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, collection: &str) -> Result<Option<ReconcileCheckpoint>> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT last_id, updated_at FROM duplex_reconcile_checkpoint WHERE collection = ?1",
                [collection],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)?;

        row.map(|(last_id, updated_at)| {
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| DuplexError::Serialization(format!("bad checkpoint timestamp: {e}")))?
                .with_timezone(&Utc);
            Ok(ReconcileCheckpoint {
                collection: collection.to_string(),
                last_id,
                updated_at,
            })
        })
        .transpose()
    }

    fn save(&self, checkpoint: &ReconcileCheckpoint) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO duplex_reconcile_checkpoint (collection, last_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection) DO UPDATE SET
                    last_id = excluded.last_id,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.collection,
                    checkpoint.last_id,
                    checkpoint.updated_at.to_rfc3339()
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM duplex_reconcile_checkpoint WHERE collection = ?1",
                [collection],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}
