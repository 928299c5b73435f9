// ============================================================================
// In-memory storage backend
// ============================================================================
//
// Optimistic transactions: a transaction remembers the commit sequence it
// started at, the keys it read and the parents whose children it scanned.
// At commit, any of those touched by a later commit fails it with a
// conflict (first committer wins). Id/date range scans are not tracked;
// callers re-read by key inside the transaction before acting on them.
// ============================================================================

use super::backend::{CommitReport, RowSource, StorageBackend, StorageTxn};
use super::{Collection, RowFilter, RowKey, StoredRow};
use crate::core::{EngineError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

type Table = BTreeMap<(i64, i64), StoredRow>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Collection, Table>,
    modified: HashMap<RowKey, u64>,
    children_modified: HashMap<(Collection, i64), u64>,
    seq: u64,
    fail_commits: u32,
}

impl MemoryState {
    fn get(&self, collection: Collection, id: i64, sub: i64) -> Option<&StoredRow> {
        self.tables.get(&collection)?.get(&(id, sub))
    }

    fn scan(&self, collection: Collection, filter: RowFilter) -> Vec<StoredRow> {
        let Some(table) = self.tables.get(&collection) else {
            return Vec::new();
        };
        match filter {
            RowFilter::Ids { lo, hi } => {
                if lo >= hi {
                    return Vec::new();
                }
                table
                    .range((lo, i64::MIN)..(hi, i64::MIN))
                    .map(|(_, row)| row.clone())
                    .collect()
            }
            RowFilter::Children { parent, .. } => table
                .range((parent, i64::MIN)..=(parent, i64::MAX))
                .map(|(_, row)| row)
                .filter(|row| filter.matches(row))
                .cloned()
                .collect(),
            RowFilter::Dates { .. } => table
                .values()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect(),
        }
    }

    fn last_modified(&self, key: &RowKey) -> u64 {
        self.modified.get(key).copied().unwrap_or(0)
    }

    fn children_last_modified(&self, collection: Collection, parent: i64) -> u64 {
        self.children_modified
            .get(&(collection, parent))
            .copied()
            .unwrap_or(0)
    }

    fn mark(&mut self, key: RowKey, seq: u64) {
        self.modified.insert(key, seq);
        self.children_modified.insert((key.collection, key.id), seq);
    }
}

/// Process-local backend. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, collection: Collection) -> usize {
        let state = self.state.read().await;
        state.tables.get(&collection).map(|t| t.len()).unwrap_or(0)
    }

    /// Makes the next `n` commits fail with an unexpected error.
    /// Fault injection for exercising retry paths.
    pub async fn fail_next_commits(&self, n: u32) {
        self.state.write().await.fail_commits = n;
    }

    /// Every row of every collection, in collection then key order.
    pub async fn dump(&self) -> Vec<StoredRow> {
        let state = self.state.read().await;
        let mut rows = Vec::new();
        for collection in Collection::ALL {
            if let Some(table) = state.tables.get(&collection) {
                rows.extend(table.values().cloned());
            }
        }
        rows
    }

    /// Replaces the whole content.
    pub async fn restore(&self, rows: Vec<StoredRow>) {
        let mut state = self.state.write().await;
        *state = MemoryState::default();
        for row in rows {
            state
                .tables
                .entry(row.collection)
                .or_default()
                .insert((row.id, row.sub), row);
        }
    }
}

#[async_trait]
impl RowSource for InMemoryBackend {
    async fn get(&self, collection: Collection, id: i64, sub: i64) -> Result<Option<StoredRow>> {
        let state = self.state.read().await;
        Ok(state.get(collection, id, sub).cloned())
    }

    async fn get_newer(
        &self,
        collection: Collection,
        id: i64,
        sub: i64,
        v: i64,
    ) -> Result<Option<StoredRow>> {
        let state = self.state.read().await;
        Ok(state
            .get(collection, id, sub)
            .filter(|row| row.v > v)
            .cloned())
    }

    async fn scan(&self, collection: Collection, filter: RowFilter) -> Result<Vec<StoredRow>> {
        let state = self.state.read().await;
        Ok(state.scan(collection, filter))
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn as_source(&self) -> &dyn RowSource {
        self
    }

    async fn begin(&self) -> Result<Box<dyn StorageTxn>> {
        let start_seq = self.state.read().await.seq;
        Ok(Box::new(MemoryTxn {
            state: self.state.clone(),
            start_seq,
            reads: Mutex::new(HashSet::new()),
            child_reads: Mutex::new(HashSet::new()),
            pending: BTreeMap::new(),
            deleted_children: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Insert(StoredRow),
    Update(StoredRow),
    Delete,
}

struct MemoryTxn {
    state: Arc<RwLock<MemoryState>>,
    start_seq: u64,
    reads: Mutex<HashSet<RowKey>>,
    child_reads: Mutex<HashSet<(Collection, i64)>>,
    pending: BTreeMap<RowKey, Pending>,
    deleted_children: Vec<(Collection, i64)>,
}

impl MemoryTxn {
    fn children_deleted(&self, collection: Collection, id: i64) -> bool {
        self.deleted_children.contains(&(collection, id))
    }

    /// Own buffered view of a key: `Some(None)` = deleted in this transaction.
    fn overlay(&self, key: &RowKey) -> Option<Option<StoredRow>> {
        match self.pending.get(key) {
            Some(Pending::Insert(row)) | Some(Pending::Update(row)) => Some(Some(row.clone())),
            Some(Pending::Delete) => Some(None),
            None if self.children_deleted(key.collection, key.id) => Some(None),
            None => None,
        }
    }
}

#[async_trait]
impl RowSource for MemoryTxn {
    async fn get(&self, collection: Collection, id: i64, sub: i64) -> Result<Option<StoredRow>> {
        let key = RowKey::new(collection, id, sub);
        if let Some(own) = self.overlay(&key) {
            return Ok(own);
        }
        self.reads.lock()?.insert(key);
        let state = self.state.read().await;
        Ok(state.get(collection, id, sub).cloned())
    }

    async fn get_newer(
        &self,
        collection: Collection,
        id: i64,
        sub: i64,
        v: i64,
    ) -> Result<Option<StoredRow>> {
        Ok(self
            .get(collection, id, sub)
            .await?
            .filter(|row| row.v > v))
    }

    async fn scan(&self, collection: Collection, filter: RowFilter) -> Result<Vec<StoredRow>> {
        if let RowFilter::Children { parent, .. } = filter {
            self.child_reads.lock()?.insert((collection, parent));
        }

        let base = {
            let state = self.state.read().await;
            state.scan(collection, filter)
        };

        let mut merged: BTreeMap<(i64, i64), StoredRow> = base
            .into_iter()
            .filter(|row| self.overlay(&row.key()).is_none())
            .map(|row| ((row.id, row.sub), row))
            .collect();

        for (key, pending) in &self.pending {
            if key.collection != collection {
                continue;
            }
            if let Pending::Insert(row) | Pending::Update(row) = pending {
                if filter.matches(row) {
                    merged.insert((row.id, row.sub), row.clone());
                }
            }
        }

        Ok(merged.into_values().collect())
    }
}

#[async_trait]
impl StorageTxn for MemoryTxn {
    fn as_source(&self) -> &dyn RowSource {
        self
    }

    fn insert(&mut self, row: StoredRow) {
        self.pending.insert(row.key(), Pending::Insert(row));
    }

    fn update(&mut self, row: StoredRow) {
        let key = row.key();
        let pending = match self.pending.get(&key) {
            Some(Pending::Insert(_)) => Pending::Insert(row),
            _ => Pending::Update(row),
        };
        self.pending.insert(key, pending);
    }

    fn delete(&mut self, collection: Collection, id: i64, sub: i64) {
        let key = RowKey::new(collection, id, sub);
        if let Some(Pending::Insert(_)) = self.pending.get(&key) {
            self.pending.remove(&key);
        } else {
            self.pending.insert(key, Pending::Delete);
        }
    }

    fn delete_children(&mut self, collection: Collection, parent: i64) {
        self.pending
            .retain(|key, _| !(key.collection == collection && key.id == parent));
        if !self.children_deleted(collection, parent) {
            self.deleted_children.push((collection, parent));
        }
    }

    fn pending_writes(&self) -> usize {
        self.pending.len() + self.deleted_children.len()
    }

    async fn commit(self: Box<Self>) -> Result<CommitReport> {
        let this = *self;
        let mut report = CommitReport::default();
        if this.pending.is_empty() && this.deleted_children.is_empty() {
            return Ok(report);
        }

        let reads = this.reads.into_inner()?;
        let child_reads = this.child_reads.into_inner()?;

        let mut state = this.state.write().await;
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(EngineError::unexpected("injected commit failure"));
        }

        for key in reads.iter().chain(this.pending.keys()) {
            if state.last_modified(key) > this.start_seq {
                return Err(EngineError::Conflict(format!(
                    "{} {}/{} changed since transaction start",
                    key.collection, key.id, key.sub
                )));
            }
        }
        for (collection, parent) in child_reads.iter().chain(this.deleted_children.iter()) {
            if state.children_last_modified(*collection, *parent) > this.start_seq {
                return Err(EngineError::Conflict(format!(
                    "children of {} {} changed since transaction start",
                    collection, parent
                )));
            }
        }
        for (key, pending) in &this.pending {
            if matches!(pending, Pending::Insert(_))
                && state.get(key.collection, key.id, key.sub).is_some()
            {
                return Err(EngineError::Conflict(format!(
                    "{} {}/{} already exists",
                    key.collection, key.id, key.sub
                )));
            }
        }

        state.seq += 1;
        let seq = state.seq;

        for (collection, parent) in &this.deleted_children {
            let removed: Vec<RowKey> = state
                .tables
                .get_mut(collection)
                .map(|table| {
                    let keys: Vec<(i64, i64)> = table
                        .range((*parent, i64::MIN)..=(*parent, i64::MAX))
                        .map(|(k, _)| *k)
                        .collect();
                    keys.into_iter()
                        .filter_map(|k| table.remove(&k))
                        .map(|row| row.key())
                        .collect()
                })
                .unwrap_or_default();
            for key in removed {
                state.mark(key, seq);
            }
            state.children_modified.insert((*collection, *parent), seq);
            report.deleted_children.push((*collection, *parent));
        }

        for (key, pending) in this.pending {
            match pending {
                Pending::Insert(row) | Pending::Update(row) => {
                    state
                        .tables
                        .entry(key.collection)
                        .or_default()
                        .insert((key.id, key.sub), row.clone());
                    report.written.push(row);
                }
                Pending::Delete => {
                    let existed = state
                        .tables
                        .get_mut(&key.collection)
                        .and_then(|table| table.remove(&(key.id, key.sub)))
                        .is_some();
                    if existed {
                        report.deleted.push(key);
                    }
                }
            }
            state.mark(key, seq);
        }

        Ok(report)
    }
}
