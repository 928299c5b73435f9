use super::{Collection, RowFilter, RowKey, StoredRow};
use crate::core::{Day, Result};
use async_trait::async_trait;

/// Read primitives shared by a backend and its transactions.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn get(&self, collection: Collection, id: i64, sub: i64) -> Result<Option<StoredRow>>;

    /// Returns the row only if its version is strictly greater than `v`.
    async fn get_newer(
        &self,
        collection: Collection,
        id: i64,
        sub: i64,
        v: i64,
    ) -> Result<Option<StoredRow>>;

    /// Rows matching `filter`, ordered by `(id, sub)`.
    async fn scan(&self, collection: Collection, filter: RowFilter) -> Result<Vec<StoredRow>>;

    async fn scan_ids(&self, collection: Collection, lo: i64, hi: i64) -> Result<Vec<StoredRow>> {
        self.scan(collection, RowFilter::Ids { lo, hi }).await
    }

    async fn scan_children(
        &self,
        collection: Collection,
        parent: i64,
        after_v: i64,
    ) -> Result<Vec<StoredRow>> {
        self.scan(collection, RowFilter::Children { parent, after_v }).await
    }

    async fn scan_dates(&self, collection: Collection, lo: Day, hi: Day) -> Result<Vec<StoredRow>> {
        self.scan(collection, RowFilter::Dates { lo, hi }).await
    }
}

/// Rows written and removed by a committed transaction.
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub written: Vec<StoredRow>,
    pub deleted: Vec<RowKey>,
    pub deleted_children: Vec<(Collection, i64)>,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.deleted.is_empty() && self.deleted_children.is_empty()
    }
}

/// One logical operation's transaction. Writes are buffered and applied as a
/// batch by `commit`; dropping without commit discards them.
#[async_trait]
pub trait StorageTxn: RowSource {
    fn as_source(&self) -> &dyn RowSource;

    /// Fails the commit with a conflict if the row already exists.
    fn insert(&mut self, row: StoredRow);

    fn update(&mut self, row: StoredRow);

    fn delete(&mut self, collection: Collection, id: i64, sub: i64);

    /// Removes every row of `collection` under `parent`.
    fn delete_children(&mut self, collection: Collection, parent: i64);

    fn pending_writes(&self) -> usize;

    async fn commit(self: Box<Self>) -> Result<CommitReport>;
}

#[async_trait]
pub trait StorageBackend: RowSource {
    fn name(&self) -> &str;

    fn as_source(&self) -> &dyn RowSource;

    async fn begin(&self) -> Result<Box<dyn StorageTxn>>;
}
