// ============================================================================
// Write cascade
// ============================================================================
//
// Stages, applied in this order:
//   1. sub-documents
//   2. avatars and groups
//   3. tenant record
//   4. usage counters of other accounts
//   5. other accounts
//   6. caller's usage counters (absorbing the operation's consumption)
//   7. caller's account
//   8. quota partitions (after the usage roll-up)
//   9. tenant synthesis (after the partition roll-up)
// Stage 0 holds unversioned intent records. A Version Record is bumped at
// most once per operation: the first stage writing into its family bumps
// it, later stages reuse the same `v`.
// ============================================================================

use super::manager::{
    DocKey, DocumentManager, Slot, SlotState, downcast, missing_entity, missing_version,
};
use super::types::{FilePurge, Partition, Synthesis, Usage};
use crate::core::{EngineError, Id, IdKind, Result, UsageSummary, codes};
use crate::storage::{Collection, CommitReport, StoredRow};
use log::warn;
use tracing::{Level, event};

const LAST_STAGE: u8 = 9;

/// What a committed cascade changed.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub report: CommitReport,
    /// `(version id, new v)` of every bumped Version Record.
    pub changed: Vec<(i64, i64)>,
    /// File deletions to run after commit.
    pub file_purges: Vec<FilePurge>,
}

impl CommitOutcome {
    pub fn is_empty(&self) -> bool {
        self.report.is_empty()
    }
}

impl DocumentManager {
    fn stage_of(&self, key: &DocKey) -> u8 {
        let is_caller = self.caller == Some(key.id);
        match key.collection {
            c if c.is_sub() => 1,
            Collection::Avatars | Collection::Groups => 2,
            Collection::Tenants => 3,
            Collection::Usages if is_caller => 6,
            Collection::Usages => 4,
            Collection::Accounts if is_caller => 7,
            Collection::Accounts => 5,
            Collection::Partitions => 8,
            Collection::Syntheses => 9,
            _ => 0,
        }
    }

    /// Stage at which a bump with no written row (tombstoning) happens.
    fn version_stage(&self, id: i64) -> u8 {
        match Id::kind(id) {
            IdKind::Tenant => 3,
            IdKind::Partition => 8,
            IdKind::Account if self.caller == Some(id) => 7,
            IdKind::Account => 5,
            _ => 2,
        }
    }

    async fn bump(&mut self, id: i64) -> Result<i64> {
        self.ensure_version(id).await?;
        let slot = self.version_slot_mut(id)?;
        let (bumped, tombstoning) = (slot.bumped, slot.tombstoning);
        let record = slot.record.as_mut().ok_or_else(|| missing_version(id))?;
        if bumped {
            return Ok(record.v);
        }
        if record.tombstoned && !tombstoning {
            return Err(EngineError::functional(
                codes::ENTITY_DELETED,
                format!("entity {} is deleted", id),
            ));
        }
        record.v += 1;
        let v = record.v;
        slot.bumped = true;
        slot.dirty = true;
        Ok(v)
    }

    /// Runs the cascade and commits the transaction.
    pub async fn commit(mut self) -> Result<CommitOutcome> {
        if self.read_only {
            if self.has_writes() {
                return Err(EngineError::assertion(
                    codes::WRITE_IN_READ_ONLY,
                    "write attempted by a read-only operation",
                ));
            }
            return Ok(CommitOutcome::default());
        }
        let absorbs = self.caller.is_some() && self.consumption > 0;
        if !absorbs && !self.has_writes() {
            return Ok(CommitOutcome::default());
        }

        for (collection, parent) in std::mem::take(&mut self.purged_children) {
            self.txn.delete_children(collection, parent);
        }
        let file_purges = self.pending_file_purges();

        for stage in 0..=LAST_STAGE {
            match stage {
                6 => self.absorb_consumption().await?,
                8 => self.roll_up_partitions().await?,
                9 => self.roll_up_synthesis().await?,
                _ => {}
            }
            self.write_stage(stage).await?;
        }
        let changed = self.write_versions();

        let writes = self.txn.pending_writes();
        let report = self.txn.commit().await?;
        event!(
            Level::DEBUG,
            writes,
            bumped = changed.len(),
            "write cascade committed"
        );
        Ok(CommitOutcome {
            report,
            changed,
            file_purges,
        })
    }

    fn pending_file_purges(&self) -> Vec<FilePurge> {
        let mut purges: Vec<FilePurge> = self
            .slots
            .iter()
            .filter(|(key, slot)| {
                key.collection == Collection::FilePurges && slot.state == SlotState::Dirty
            })
            .filter_map(|(_, slot)| downcast::<FilePurge>(slot.doc.as_ref()?).ok().cloned())
            .collect();
        purges.sort_by_key(|purge| (purge.owner, purge.sub));
        purges
    }

    async fn write_stage(&mut self, stage: u8) -> Result<()> {
        let mut keys: Vec<DocKey> = self
            .slots
            .iter()
            .filter(|(key, slot)| slot.state != SlotState::Clean && self.stage_of(key) == stage)
            .map(|(key, _)| *key)
            .collect();
        keys.sort();

        for key in keys {
            let Some((state, versioned)) = self.slots.get(&key).map(|s| (s.state, s.versioned))
            else {
                continue;
            };

            if state == SlotState::Purged {
                self.txn.delete(key.collection, key.id, key.sub);
            } else {
                let v = if versioned { self.bump(key.id).await? } else { 0 };
                let slot = self
                    .slots
                    .get_mut(&key)
                    .ok_or_else(|| missing_entity(key.collection, key.id, key.sub))?;
                let row = match state {
                    SlotState::Dirty => {
                        let doc = slot
                            .doc
                            .as_ref()
                            .ok_or_else(|| missing_entity(key.collection, key.id, key.sub))?;
                        StoredRow {
                            collection: key.collection,
                            id: key.id,
                            sub: key.sub,
                            v,
                            date: doc.date_column(),
                            deleted: false,
                            data: doc.payload()?,
                        }
                    }
                    _ => StoredRow {
                        collection: key.collection,
                        id: key.id,
                        sub: key.sub,
                        v,
                        date: None,
                        deleted: true,
                        data: Vec::new(),
                    },
                };
                if slot.existed {
                    self.txn.update(row);
                } else {
                    self.txn.insert(row);
                }
                slot.existed = true;
                if state == SlotState::Dirty {
                    self.written.push(key);
                }
            }

            if let Some(slot) = self.slots.get_mut(&key) {
                slot.state = SlotState::Clean;
            }
        }

        let mut ids: Vec<i64> = self
            .versions
            .iter()
            .filter(|(id, slot)| {
                slot.pending_bump
                    && !slot.bumped
                    && !slot.removed
                    && self.version_stage(**id) == stage
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            self.bump(id).await?;
        }
        Ok(())
    }

    fn write_versions(&mut self) -> Vec<(i64, i64)> {
        let mut ids: Vec<i64> = self
            .versions
            .iter()
            .filter(|(_, slot)| slot.dirty || slot.removed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        let mut changed = Vec::new();
        for id in ids {
            let Some(slot) = self.versions.get(&id) else {
                continue;
            };
            if slot.removed {
                if slot.existed {
                    self.txn.delete(Collection::Versions, id, 0);
                }
                continue;
            }
            let Some(record) = slot.record else {
                continue;
            };
            if slot.bumped {
                changed.push((id, record.v));
            }
            if slot.existed {
                self.txn.update(record.to_row());
            } else {
                self.txn.insert(record.to_row());
            }
        }
        changed
    }

    // ------------------------------------------------------------------------
    // Roll-ups
    // ------------------------------------------------------------------------

    async fn absorb_consumption(&mut self) -> Result<()> {
        let (Some(caller), amount) = (self.caller, self.consumption) else {
            return Ok(());
        };
        if amount == 0 {
            return Ok(());
        }
        let today = self.today;
        match self.get_mut::<Usage>(caller).await? {
            Some(usage) => usage.counters.record_consumption(amount, today),
            None => warn!("consumption {} dropped: account {} has no usage record", amount, caller),
        }
        self.consumption = 0;
        Ok(())
    }

    /// Live documents of `collection` written by earlier stages.
    fn written_docs(&self, collection: Collection) -> impl Iterator<Item = (&DocKey, &Slot)> {
        self.written
            .iter()
            .filter(move |key| key.collection == collection)
            .filter_map(|key| Some((key, self.slots.get(key)?)))
    }

    fn written_usage_lines(&self) -> Vec<(i64, i64, UsageSummary)> {
        let mut lines: Vec<(i64, i64, UsageSummary)> = self
            .written_docs(Collection::Usages)
            .filter_map(|(key, slot)| {
                let usage = downcast::<Usage>(slot.doc.as_ref()?).ok()?;
                Some((usage.partition?, key.id, usage.counters.summary()))
            })
            .collect();
        lines.sort_by_key(|(partition, account, _)| (*partition, *account));
        lines
    }

    async fn roll_up_partitions(&mut self) -> Result<()> {
        for (partition, account, line) in self.written_usage_lines() {
            let current = self
                .get::<Partition>(partition)
                .await?
                .map(|p| p.accounts.get(&account).copied());
            match current {
                None => warn!(
                    "usage of account {} references missing partition {}",
                    account, partition
                ),
                Some(existing) if existing == Some(line) => {}
                Some(_) => {
                    if let Some(p) = self.get_mut::<Partition>(partition).await? {
                        p.set_line(account, line);
                    }
                }
            }
        }
        Ok(())
    }

    async fn roll_up_synthesis(&mut self) -> Result<()> {
        let mut lines: Vec<(i64, UsageSummary)> = self
            .written_docs(Collection::Partitions)
            .filter_map(|(key, slot)| {
                let partition = downcast::<Partition>(slot.doc.as_ref()?).ok()?;
                Some((key.id, partition.total))
            })
            .collect();
        lines.sort_by_key(|(partition, _)| *partition);

        for (partition, total) in lines {
            let ns = Id::ns(partition);
            let current = self
                .get::<Synthesis>(ns)
                .await?
                .map(|s| s.partitions.get(&partition).copied());
            match current {
                Some(existing) if existing == Some(total) => {}
                Some(_) => {
                    if let Some(synthesis) = self.get_mut::<Synthesis>(ns).await? {
                        synthesis.set_line(partition, total);
                    }
                }
                None => {
                    if self.is_alive(ns).await? {
                        self.create(Synthesis::new(ns))
                            .await?
                            .set_line(partition, total);
                    } else {
                        warn!("partition {} rolls up into missing tenant {}", partition, ns);
                    }
                }
            }
        }
        Ok(())
    }
}
