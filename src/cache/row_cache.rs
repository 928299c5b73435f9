// ============================================================================
// Process-wide read cache of major rows and version records
// ============================================================================
//
// Entries are immutable `Arc<StoredRow>` snapshots keyed by (collection, id).
// A cached entry is never trusted blindly: every read probes the source with
// `get_newer(v)` so a stale entry costs one cheap read instead of a full one.
// An entry is only ever replaced by a strictly higher version.
// ============================================================================

use crate::core::Result;
use crate::storage::{Collection, CommitReport, RowSource, StoredRow};
use log::warn;
use lru::LruCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type CacheKey = (Collection, i64);

#[derive(Debug, Clone)]
pub struct CachedRow {
    pub last_access: Instant,
    pub row: Arc<StoredRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshed: u64,
    pub evicted: u64,
}

pub struct RowCache {
    entries: Mutex<LruCache<CacheKey, CachedRow>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshed: AtomicU64,
    evicted: AtomicU64,
}

impl RowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(2),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Returns the current row, reading through `source` (usually the
    /// operation's transaction, so the read is conflict-tracked).
    pub async fn get_fresh(
        &self,
        source: &dyn RowSource,
        collection: Collection,
        id: i64,
    ) -> Result<Option<Arc<StoredRow>>> {
        match self.peek(collection, id)? {
            Some(cached) => match source.get_newer(collection, id, 0, cached.v).await? {
                Some(newer) => {
                    self.refreshed.fetch_add(1, Ordering::Relaxed);
                    let newer = Arc::new(newer);
                    self.offer(newer.clone())?;
                    Ok(Some(newer))
                }
                None => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(cached))
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                match source.get(collection, id, 0).await? {
                    Some(row) => {
                        let row = Arc::new(row);
                        self.offer(row.clone())?;
                        Ok(Some(row))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Cached row without touching the source; refreshes its access time.
    pub fn peek(&self, collection: Collection, id: i64) -> Result<Option<Arc<StoredRow>>> {
        let mut entries = self.entries.lock()?;
        Ok(entries.get_mut(&(collection, id)).map(|entry| {
            entry.last_access = Instant::now();
            entry.row.clone()
        }))
    }

    /// Inserts `row` unless an equal or newer version is already cached.
    /// Returns whether the entry changed.
    pub fn offer(&self, row: Arc<StoredRow>) -> Result<bool> {
        if !row.collection.is_cached() || row.sub != 0 {
            warn!(
                "row cache refused non-major row {}/{}/{}",
                row.collection, row.id, row.sub
            );
            return Ok(false);
        }

        let mut entries = self.entries.lock()?;
        let key = (row.collection, row.id);
        if let Some(existing) = entries.peek(&key) {
            if existing.row.v >= row.v {
                return Ok(false);
            }
        }
        entries.put(
            key,
            CachedRow {
                last_access: Instant::now(),
                row,
            },
        );

        if entries.len() > self.capacity {
            let drop = entries.len() / 2;
            for _ in 0..drop {
                entries.pop_lru();
            }
            self.evicted.fetch_add(drop as u64, Ordering::Relaxed);
        }
        Ok(true)
    }

    pub fn evict(&self, collection: Collection, id: i64) -> Result<()> {
        self.entries.lock()?.pop(&(collection, id));
        Ok(())
    }

    /// Propagates a committed batch: written major rows and version records
    /// are offered, deleted keys are evicted.
    pub fn apply_commit(&self, report: &CommitReport) -> Result<()> {
        for row in &report.written {
            if row.collection.is_cached() && row.sub == 0 {
                self.offer(Arc::new(row.clone()))?;
            }
        }
        for key in &report.deleted {
            if key.collection.is_cached() && key.sub == 0 {
                self.evict(key.collection, key.id)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, v: i64) -> Arc<StoredRow> {
        Arc::new(StoredRow {
            collection: Collection::Accounts,
            id,
            sub: 0,
            v,
            date: None,
            deleted: false,
            data: Vec::new(),
        })
    }

    #[test]
    fn never_downgrades() {
        let cache = RowCache::new(10);
        assert!(cache.offer(row(1, 5)).unwrap());
        assert!(!cache.offer(row(1, 4)).unwrap());
        assert!(!cache.offer(row(1, 5)).unwrap());
        assert!(cache.offer(row(1, 6)).unwrap());
        assert_eq!(cache.peek(Collection::Accounts, 1).unwrap().unwrap().v, 6);
    }

    #[test]
    fn evicts_least_recent_half() {
        let cache = RowCache::new(4);
        for id in 1..=4 {
            cache.offer(row(id, 1)).unwrap();
        }
        // touch 1 so it survives
        cache.peek(Collection::Accounts, 1).unwrap();
        cache.offer(row(5, 1)).unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.peek(Collection::Accounts, 1).unwrap().is_some());
        assert!(cache.peek(Collection::Accounts, 2).unwrap().is_none());
        assert!(cache.peek(Collection::Accounts, 5).unwrap().is_some());
        assert_eq!(cache.stats().evicted, 2);
    }

    #[test]
    fn refuses_sub_rows() {
        let cache = RowCache::new(4);
        let mut note = (*row(1, 1)).clone();
        note.collection = Collection::Notes;
        note.sub = 3;
        assert!(!cache.offer(Arc::new(note)).unwrap());
        assert!(cache.is_empty());
    }
}
