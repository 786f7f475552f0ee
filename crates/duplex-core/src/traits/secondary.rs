use async_trait::async_trait;

use crate::traits::BackendResult;
use crate::types::{Predicate, Row, RowMutation};

/// Adapter for the relational store.
#[async_trait]
pub trait SecondaryStore: Send + Sync + 'static {
    /// Apply one row-level upsert or delete.
    async fn execute_row(&self, mutation: &RowMutation) -> BackendResult<()>;

    /// Run a compiled predicate against `table`.
    async fn query(&self, table: &str, predicate: &Predicate) -> BackendResult<Vec<Row>>;

    /// Rows with `id_column > after_id`, ascending, at most `page_size`.
    async fn list_page(
        &self,
        table: &str,
        id_column: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Row>>;
}
