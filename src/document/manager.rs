// ============================================================================
// Document Manager: per-operation working set
// ============================================================================
//
// Entities are loaded lazily through the operation's transaction (majors via
// the shared row cache) and kept as typed, type-erased slots keyed by
// `DocKey`. Mutating accessors only mark slots dirty; nothing reaches the
// backend before the write cascade in `cascade.rs`.
// ============================================================================

use super::types::{Document, FilePurge, VersionRecord};
use crate::cache::RowCache;
use crate::core::days::plus_days;
use crate::core::{Day, EngineError, Result, codes};
use crate::storage::{Collection, RowFilter, StorageTxn, StoredRow};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Strongly typed working-set key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: Collection,
    pub id: i64,
    pub sub: i64,
}

impl DocKey {
    pub fn new(collection: Collection, id: i64, sub: i64) -> Self {
        Self { collection, id, sub }
    }

    pub fn of<T: Document>(doc: &T) -> Self {
        Self::new(T::COLLECTION, doc.id(), doc.sub())
    }
}

pub(super) trait ErasedDoc: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn payload(&self) -> Result<Vec<u8>>;
    fn date_column(&self) -> Option<Day>;
}

impl<T: Document> ErasedDoc for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn payload(&self) -> Result<Vec<u8>> {
        self.encode()
    }

    fn date_column(&self) -> Option<Day> {
        self.date()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SlotState {
    Clean,
    /// Written by the cascade (versioned rows get the bumped `v`).
    Dirty,
    /// Soft delete: a deletion marker row carrying the bumped `v`.
    Deleted,
    /// Physical delete, no version bump.
    Purged,
}

pub(super) struct Slot {
    pub(super) doc: Option<Box<dyn ErasedDoc>>,
    pub(super) versioned: bool,
    /// A row (possibly a deletion marker) is stored under this key.
    pub(super) existed: bool,
    pub(super) state: SlotState,
}

impl Slot {
    fn absent(versioned: bool) -> Self {
        Self {
            doc: None,
            versioned,
            existed: false,
            state: SlotState::Clean,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(super) struct VersionSlot {
    pub(super) record: Option<VersionRecord>,
    pub(super) existed: bool,
    /// Already bumped by this operation.
    pub(super) bumped: bool,
    /// Needs a bump even if no row of the family is written.
    pub(super) pending_bump: bool,
    /// Tombstoned by this operation: the final bump is still allowed.
    pub(super) tombstoning: bool,
    pub(super) dirty: bool,
    pub(super) removed: bool,
}

pub struct DocumentManager {
    pub(super) txn: Box<dyn StorageTxn>,
    pub(super) cache: Arc<RowCache>,
    pub(super) today: Day,
    pub(super) caller: Option<i64>,
    pub(super) read_only: bool,
    pub(super) purge_grace_days: u64,
    pub(super) slots: HashMap<DocKey, Slot>,
    pub(super) versions: HashMap<i64, VersionSlot>,
    pub(super) purged_children: Vec<(Collection, i64)>,
    /// Live rows already written by the cascade, in write order.
    pub(super) written: Vec<DocKey>,
    pub(super) consumption: u64,
}

pub(super) fn downcast<T: Document>(doc: &Box<dyn ErasedDoc>) -> Result<&T> {
    doc.as_any().downcast_ref::<T>().ok_or_else(|| {
        EngineError::assertion(
            codes::WRONG_DOCUMENT_TYPE,
            format!("working-set slot is not a {}", T::COLLECTION),
        )
    })
}

pub(super) fn downcast_mut<T: Document>(doc: &mut Box<dyn ErasedDoc>) -> Result<&mut T> {
    doc.as_any_mut().downcast_mut::<T>().ok_or_else(|| {
        EngineError::assertion(
            codes::WRONG_DOCUMENT_TYPE,
            format!("working-set slot is not a {}", T::COLLECTION),
        )
    })
}

impl DocumentManager {
    pub fn new(txn: Box<dyn StorageTxn>, cache: Arc<RowCache>, today: Day) -> Self {
        Self {
            txn,
            cache,
            today,
            caller: None,
            read_only: false,
            purge_grace_days: 2,
            slots: HashMap::new(),
            versions: HashMap::new(),
            purged_children: Vec::new(),
            written: Vec::new(),
            consumption: 0,
        }
    }

    pub fn with_caller(mut self, account: Option<i64>) -> Self {
        self.caller = account;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_purge_grace(mut self, days: u64) -> Self {
        self.purge_grace_days = days;
        self
    }

    pub fn today(&self) -> Day {
        self.today
    }

    pub fn caller(&self) -> Option<i64> {
        self.caller
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn guard_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(EngineError::functional(
                codes::READ_ONLY,
                "operation runs in read-only mode",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Version records
    // ------------------------------------------------------------------------

    pub(super) async fn ensure_version(&mut self, id: i64) -> Result<()> {
        if self.versions.contains_key(&id) {
            return Ok(());
        }
        let row = self
            .cache
            .get_fresh(self.txn.as_source(), Collection::Versions, id)
            .await?;
        let slot = VersionSlot {
            record: row.as_deref().map(VersionRecord::from_row),
            existed: row.is_some(),
            ..VersionSlot::default()
        };
        self.versions.insert(id, slot);
        Ok(())
    }

    /// Current state of a Version Record as seen by this operation.
    pub async fn version(&mut self, id: i64) -> Result<Option<VersionRecord>> {
        self.ensure_version(id).await?;
        Ok(self.versions.get(&id).and_then(|slot| slot.record))
    }

    /// True when the Version Record exists and is not tombstoned.
    pub async fn is_alive(&mut self, id: i64) -> Result<bool> {
        Ok(matches!(self.version(id).await?, Some(record) if !record.tombstoned))
    }

    /// Marks an entity logically deleted; purge becomes eligible after the
    /// grace period. Returns false if it was already tombstoned.
    pub async fn tombstone(&mut self, id: i64) -> Result<bool> {
        self.guard_writable()?;
        self.ensure_version(id).await?;
        let purge_date = plus_days(self.today, self.purge_grace_days);
        let slot = self.version_slot_mut(id)?;
        let record = slot.record.as_mut().ok_or_else(|| missing_version(id))?;
        if record.tombstoned {
            return Ok(false);
        }
        record.tombstoned = true;
        record.date = Some(purge_date);
        slot.tombstoning = true;
        slot.pending_bump = true;
        slot.dirty = true;
        Ok(true)
    }

    /// Rewrites the scheduled date of a record, tombstoned or not. The
    /// version still moves forward once: cached copies are only ever replaced
    /// by a higher version.
    pub async fn restamp_version(&mut self, id: i64, date: Option<Day>) -> Result<()> {
        self.guard_writable()?;
        self.ensure_version(id).await?;
        let slot = self.version_slot_mut(id)?;
        let bumped = slot.bumped;
        let record = slot.record.as_mut().ok_or_else(|| missing_version(id))?;
        record.date = date;
        if !bumped {
            record.v += 1;
        }
        slot.bumped = true;
        slot.dirty = true;
        Ok(())
    }

    /// Physically removes a Version Record (end of its retention window).
    pub async fn remove_version(&mut self, id: i64) -> Result<()> {
        self.guard_writable()?;
        self.ensure_version(id).await?;
        let slot = self.version_slot_mut(id)?;
        slot.removed = true;
        Ok(())
    }

    pub(super) fn version_slot_mut(&mut self, id: i64) -> Result<&mut VersionSlot> {
        self.versions.get_mut(&id).ok_or_else(|| missing_version(id))
    }

    // ------------------------------------------------------------------------
    // Typed reads
    // ------------------------------------------------------------------------

    async fn load<T: Document>(&mut self, key: DocKey) -> Result<()> {
        if self.slots.contains_key(&key) {
            return Ok(());
        }
        if T::VERSIONED && !self.is_alive(key.id).await? {
            self.slots.insert(key, Slot::absent(true));
            return Ok(());
        }

        let row = if key.sub == 0 && key.collection.is_cached() {
            self.cache
                .get_fresh(self.txn.as_source(), key.collection, key.id)
                .await?
        } else {
            self.txn
                .get(key.collection, key.id, key.sub)
                .await?
                .map(Arc::new)
        };

        let mut slot = Slot::absent(T::VERSIONED);
        if let Some(row) = row {
            slot.existed = true;
            if !row.deleted {
                slot.doc = Some(Box::new(T::decode(&row)?));
            }
        }
        self.slots.insert(key, slot);
        Ok(())
    }

    fn typed<T: Document>(&self, key: &DocKey) -> Result<Option<&T>> {
        match self.slots.get(key).and_then(|slot| slot.doc.as_ref()) {
            Some(doc) => downcast::<T>(doc).map(Some),
            None => Ok(None),
        }
    }

    fn typed_mut<T: Document>(&mut self, key: &DocKey) -> Result<Option<&mut T>> {
        let Some(slot) = self.slots.get_mut(key) else {
            return Ok(None);
        };
        let Some(doc) = slot.doc.as_mut() else {
            return Ok(None);
        };
        if slot.state == SlotState::Clean {
            slot.state = SlotState::Dirty;
        }
        downcast_mut::<T>(doc).map(Some)
    }

    /// A major document, `None` if absent or tombstoned.
    pub async fn get<T: Document>(&mut self, id: i64) -> Result<Option<&T>> {
        self.get_sub::<T>(id, 0).await
    }

    pub async fn get_sub<T: Document>(&mut self, id: i64, sub: i64) -> Result<Option<&T>> {
        let key = DocKey::new(T::COLLECTION, id, sub);
        self.load::<T>(key).await?;
        self.typed::<T>(&key)
    }

    /// Like [`get`](Self::get) but fails with an assertion when absent.
    pub async fn require<T: Document>(&mut self, id: i64) -> Result<&T> {
        self.get::<T>(id)
            .await?
            .ok_or_else(|| missing_entity(T::COLLECTION, id, 0))
    }

    /// Loads and marks dirty: the cascade writes it with the bumped version.
    pub async fn get_mut<T: Document>(&mut self, id: i64) -> Result<Option<&mut T>> {
        self.get_sub_mut::<T>(id, 0).await
    }

    pub async fn get_sub_mut<T: Document>(&mut self, id: i64, sub: i64) -> Result<Option<&mut T>> {
        self.guard_writable()?;
        let key = DocKey::new(T::COLLECTION, id, sub);
        self.load::<T>(key).await?;
        self.typed_mut::<T>(&key)
    }

    pub async fn require_mut<T: Document>(&mut self, id: i64) -> Result<&mut T> {
        self.get_mut::<T>(id)
            .await?
            .ok_or_else(|| missing_entity(T::COLLECTION, id, 0))
    }

    /// Live sub-documents of `id`, ordered by sub id, including those created
    /// by this operation.
    pub async fn list_subs<T: Document>(&mut self, id: i64) -> Result<Vec<T>> {
        if T::VERSIONED && !self.is_alive(id).await? {
            return Ok(Vec::new());
        }
        let rows = self.txn.scan_children(T::COLLECTION, id, 0).await?;
        for row in rows {
            let key = DocKey::new(T::COLLECTION, row.id, row.sub);
            if self.slots.contains_key(&key) {
                continue;
            }
            let mut slot = Slot::absent(T::VERSIONED);
            slot.existed = true;
            if !row.deleted {
                slot.doc = Some(Box::new(T::decode(&row)?));
            }
            self.slots.insert(key, slot);
        }

        let mut keys: Vec<DocKey> = self
            .slots
            .keys()
            .filter(|key| key.collection == T::COLLECTION && key.id == id && key.sub != 0)
            .copied()
            .collect();
        keys.sort();

        let mut docs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(doc) = self.typed::<T>(&key)? {
                docs.push(doc.clone());
            }
        }
        Ok(docs)
    }

    // ------------------------------------------------------------------------
    // Creation and deletion
    // ------------------------------------------------------------------------

    /// Adds a new document. A new major entity gets its Version Record in the
    /// same cascade; a sub-document requires its parent's record to exist.
    pub async fn create<T: Document>(&mut self, doc: T) -> Result<&mut T> {
        self.guard_writable()?;
        let key = DocKey::of(&doc);

        if T::VERSIONED {
            self.ensure_version(key.id).await?;
            let is_sub = key.collection.is_sub();
            let slot = self.version_slot_mut(key.id)?;
            match slot.record.map(|record| record.tombstoned) {
                Some(true) => {
                    return Err(EngineError::functional(
                        codes::ENTITY_DELETED,
                        format!("entity {} is deleted", key.id),
                    ));
                }
                Some(false) => {}
                None if is_sub => return Err(missing_version(key.id)),
                None => {
                    slot.record = Some(VersionRecord::new(key.id));
                    slot.dirty = true;
                }
            }
        }

        self.load::<T>(key).await?;
        let slot = self
            .slots
            .get_mut(&key)
            .ok_or_else(|| missing_entity(key.collection, key.id, key.sub))?;
        if slot.doc.is_some() {
            return Err(EngineError::assertion(
                codes::DUPLICATE_ENTITY,
                format!("{} {}/{} already exists", key.collection, key.id, key.sub),
            ));
        }
        slot.doc = Some(Box::new(doc));
        slot.state = SlotState::Dirty;
        self.typed_mut::<T>(&key)?
            .ok_or_else(|| missing_entity(key.collection, key.id, key.sub))
    }

    /// Soft-deletes a sub-document: a deletion marker carrying the new version
    /// replaces it, so incremental sync can report the removal. Unversioned
    /// records are removed physically. Returns false if nothing was there.
    pub async fn delete_sub<T: Document>(&mut self, id: i64, sub: i64) -> Result<bool> {
        self.guard_writable()?;
        let key = DocKey::new(T::COLLECTION, id, sub);
        self.load::<T>(key).await?;
        let Some(slot) = self.slots.get_mut(&key) else {
            return Ok(false);
        };
        if slot.doc.is_none() {
            return Ok(false);
        }
        slot.doc = None;
        slot.state = if !slot.existed {
            SlotState::Clean
        } else if slot.versioned {
            SlotState::Deleted
        } else {
            SlotState::Purged
        };
        Ok(true)
    }

    /// Physically removes one row, live or not, without a version bump.
    pub fn purge_row(&mut self, collection: Collection, id: i64, sub: i64) -> Result<()> {
        self.guard_writable()?;
        let key = DocKey::new(collection, id, sub);
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Slot::absent(false));
        slot.doc = None;
        slot.existed = true;
        slot.state = SlotState::Purged;
        Ok(())
    }

    /// Physically removes every row of `collection` under `parent`.
    pub fn purge_children(&mut self, collection: Collection, parent: i64) -> Result<()> {
        self.guard_writable()?;
        self.slots
            .retain(|key, _| !(key.collection == collection && key.id == parent));
        if !self.purged_children.contains(&(collection, parent)) {
            self.purged_children.push((collection, parent));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Raw access (sync, gc)
    // ------------------------------------------------------------------------

    /// Stored major row, deletion markers included, read through the cache.
    pub async fn major_row(&self, collection: Collection, id: i64) -> Result<Option<Arc<StoredRow>>> {
        if collection.is_cached() {
            self.cache.get_fresh(self.txn.as_source(), collection, id).await
        } else {
            Ok(self.txn.get(collection, id, 0).await?.map(Arc::new))
        }
    }

    /// Child rows of `parent` whose version exceeds `after_v`, markers included.
    pub async fn child_rows(
        &self,
        collection: Collection,
        parent: i64,
        after_v: i64,
    ) -> Result<Vec<StoredRow>> {
        self.txn.scan_children(collection, parent, after_v).await
    }

    pub async fn scan_rows(&self, collection: Collection, filter: RowFilter) -> Result<Vec<StoredRow>> {
        self.txn.scan(collection, filter).await
    }

    // ------------------------------------------------------------------------
    // Consumption and intents
    // ------------------------------------------------------------------------

    /// Consumption accumulated during the operation; absorbed into the
    /// caller's usage counters by the cascade.
    pub fn consume(&mut self, amount: u64) {
        self.consumption = self.consumption.saturating_add(amount);
    }

    pub fn consumption(&self) -> u64 {
        self.consumption
    }

    /// Records a durable intent to delete files after commit
    /// (`files == None`: every file of `owner`).
    pub async fn schedule_file_purge(&mut self, owner: i64, files: Option<Vec<String>>) -> Result<()> {
        let sub = (uuid::Uuid::new_v4().as_u128() >> 65) as i64;
        self.create(FilePurge { owner, sub, files }).await?;
        Ok(())
    }

    /// True when the cascade has anything to write.
    pub fn has_writes(&self) -> bool {
        !self.purged_children.is_empty()
            || self.slots.values().any(|slot| slot.state != SlotState::Clean)
            || self
                .versions
                .values()
                .any(|slot| slot.dirty || slot.pending_bump || slot.removed)
    }
}

pub(super) fn missing_version(id: i64) -> EngineError {
    EngineError::assertion(
        codes::MISSING_VERSION,
        format!("version record {} does not exist", id),
    )
}

pub(super) fn missing_entity(collection: Collection, id: i64, sub: i64) -> EngineError {
    EngineError::assertion(
        codes::MISSING_ENTITY,
        format!("{} {}/{} does not exist", collection, id, sub),
    )
}
