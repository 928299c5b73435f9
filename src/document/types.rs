// ============================================================================
// Typed documents
// ============================================================================
//
// Every row is versioned by the Version Record keyed by its `id`: a major
// entity by its own id, a sub-document by its parent's. Families sharing an
// id (account + usage counters + primary avatar, tenant + synthesis) share
// one Version Record and are bumped together.
// ============================================================================

use crate::core::{Counters, Day, Result, UsageSummary};
use crate::storage::{Collection, StoredRow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    /// Unversioned records (intents, checkpoints) are written as-is.
    const VERSIONED: bool = true;

    fn id(&self) -> i64;

    fn sub(&self) -> i64 {
        0
    }

    /// Indexed date column used by date-range scans.
    fn date(&self) -> Option<Day> {
        None
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    fn decode(row: &StoredRow) -> Result<Self> {
        Ok(rmp_serde::from_slice(&row.data)?)
    }
}

/// `{id, v, tombstoned?, scheduledDate}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: i64,
    pub v: i64,
    pub tombstoned: bool,
    /// Expiry while alive, purge date once tombstoned, re-stamped far in the
    /// future after physical purge.
    pub date: Option<Day>,
}

impl VersionRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            v: 0,
            tombstoned: false,
            date: None,
        }
    }

    pub fn from_row(row: &StoredRow) -> Self {
        Self {
            id: row.id,
            v: row.v,
            tombstoned: row.deleted,
            date: row.date,
        }
    }

    pub fn to_row(&self) -> StoredRow {
        StoredRow {
            collection: Collection::Versions,
            id: self.id,
            sub: 0,
            v: self.v,
            date: self.date,
            deleted: self.tombstoned,
            data: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Major entities
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub ns: i64,
    pub org: String,
    /// No access at all.
    pub closed: bool,
    /// Read-only access for operations that allow it.
    pub frozen: bool,
    pub notice: Option<String>,
}

impl Document for Tenant {
    const COLLECTION: Collection = Collection::Tenants;

    fn id(&self) -> i64 {
        self.ns
    }
}

/// Tenant-wide aggregate of partition summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    pub ns: i64,
    pub partitions: BTreeMap<i64, UsageSummary>,
    pub total: UsageSummary,
}

impl Synthesis {
    pub fn new(ns: i64) -> Self {
        Self {
            ns,
            ..Self::default()
        }
    }

    pub fn set_line(&mut self, partition: i64, line: UsageSummary) {
        self.partitions.insert(partition, line);
        self.total = sum(self.partitions.values());
    }
}

impl Document for Synthesis {
    const COLLECTION: Collection = Collection::Syntheses;

    fn id(&self) -> i64 {
        self.ns
    }
}

/// Quota partition ("tribe"): per-account usage lines and their total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: i64,
    pub accounts: BTreeMap<i64, UsageSummary>,
    pub total: UsageSummary,
    pub data: Vec<u8>,
}

impl Partition {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn set_line(&mut self, account: i64, line: UsageSummary) {
        self.accounts.insert(account, line);
        self.total = sum(self.accounts.values());
    }

    pub fn remove_line(&mut self, account: i64) {
        self.accounts.remove(&account);
        self.total = sum(self.accounts.values());
    }
}

impl Document for Partition {
    const COLLECTION: Collection = Collection::Partitions;

    fn id(&self) -> i64 {
        self.id
    }
}

/// Access an account has to one group's sub-collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAccess {
    pub members: bool,
    pub notes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub partition: Option<i64>,
    /// Every avatar of the account, the primary one (same id) included.
    pub avatars: BTreeSet<i64>,
    pub groups: BTreeMap<i64, GroupAccess>,
    pub data: Vec<u8>,
}

impl Account {
    pub fn new(id: i64, partition: Option<i64>) -> Self {
        Self {
            id,
            partition,
            avatars: BTreeSet::from([id]),
            ..Self::default()
        }
    }
}

impl Document for Account {
    const COLLECTION: Collection = Collection::Accounts;

    fn id(&self) -> i64 {
        self.id
    }
}

/// Usage counters of an account (same id and version as the account).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub id: i64,
    pub partition: Option<i64>,
    pub counters: Counters,
}

impl Usage {
    pub fn new(id: i64, partition: Option<i64>, counters: Counters) -> Self {
        Self {
            id,
            partition,
            counters,
        }
    }
}

impl Document for Usage {
    const COLLECTION: Collection = Collection::Usages;

    fn id(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    pub id: i64,
    pub data: Vec<u8>,
}

impl Document for Avatar {
    const COLLECTION: Collection = Collection::Avatars;

    fn id(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    /// Account charged for the group's file volume.
    pub host: Option<i64>,
    /// Set when the group lost its host; the group expires after it.
    pub hosting_end: Option<Day>,
    pub volume: u64,
    pub data: Vec<u8>,
}

impl Document for Group {
    const COLLECTION: Collection = Collection::Groups;

    fn id(&self) -> i64 {
        self.id
    }

    fn date(&self) -> Option<Day> {
        self.hosting_end
    }
}

// ----------------------------------------------------------------------------
// Sub-documents
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Owning avatar or group.
    pub id: i64,
    pub sub: i64,
    pub files: Vec<String>,
    pub volume: u64,
    pub data: Vec<u8>,
}

impl Document for Note {
    const COLLECTION: Collection = Collection::Notes;

    fn id(&self) -> i64 {
        self.id
    }

    fn sub(&self) -> i64 {
        self.sub
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub sub: i64,
    pub data: Vec<u8>,
}

impl Document for Chat {
    const COLLECTION: Collection = Collection::Chats;

    fn id(&self) -> i64 {
        self.id
    }

    fn sub(&self) -> i64 {
        self.sub
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Group id.
    pub id: i64,
    pub sub: i64,
    pub avatar: i64,
    pub expires: Option<Day>,
    pub data: Vec<u8>,
}

impl Document for Member {
    const COLLECTION: Collection = Collection::Members;

    fn id(&self) -> i64 {
        self.id
    }

    fn sub(&self) -> i64 {
        self.sub
    }

    fn date(&self) -> Option<Day> {
        self.expires
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Accountable account id.
    pub id: i64,
    pub sub: i64,
    pub data: Vec<u8>,
}

impl Document for Ticket {
    const COLLECTION: Collection = Collection::Tickets;

    fn id(&self) -> i64 {
        self.id
    }

    fn sub(&self) -> i64 {
        self.sub
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sponsorship {
    /// Sponsoring partition id.
    pub id: i64,
    pub sub: i64,
    pub expires: Day,
    pub data: Vec<u8>,
}

impl Document for Sponsorship {
    const COLLECTION: Collection = Collection::Sponsorships;

    fn id(&self) -> i64 {
        self.id
    }

    fn sub(&self) -> i64 {
        self.sub
    }

    fn date(&self) -> Option<Day> {
        Some(self.expires)
    }
}

// ----------------------------------------------------------------------------
// Durable intents
// ----------------------------------------------------------------------------

/// Upload in progress: its files are deleted if it is never confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub owner: i64,
    pub sub: i64,
    pub expires: Day,
    pub files: Vec<String>,
}

impl Document for Transfer {
    const COLLECTION: Collection = Collection::Transfers;
    const VERSIONED: bool = false;

    fn id(&self) -> i64 {
        self.owner
    }

    fn sub(&self) -> i64 {
        self.sub
    }

    fn date(&self) -> Option<Day> {
        Some(self.expires)
    }
}

/// Files to delete after commit; `files == None` means every file of `owner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePurge {
    pub owner: i64,
    pub sub: i64,
    pub files: Option<Vec<String>>,
}

impl Document for FilePurge {
    const COLLECTION: Collection = Collection::FilePurges;
    const VERSIONED: bool = false;

    fn id(&self) -> i64 {
        self.owner
    }

    fn sub(&self) -> i64 {
        self.sub
    }
}

fn sum<'a>(lines: impl Iterator<Item = &'a UsageSummary>) -> UsageSummary {
    let mut total = UsageSummary::default();
    for line in lines {
        total.add(line);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_record_maps_onto_row_columns() {
        let record = VersionRecord {
            id: 9,
            v: 4,
            tombstoned: true,
            date: chrono::NaiveDate::from_ymd_opt(2026, 1, 2),
        };
        let row = record.to_row();
        assert!(row.deleted);
        assert_eq!(row.collection, Collection::Versions);
        assert_eq!(VersionRecord::from_row(&row), record);
    }

    #[test]
    fn partition_total_tracks_lines() {
        let mut p = Partition::new(1);
        p.set_line(10, UsageSummary { v1: 3, ..UsageSummary::default() });
        p.set_line(11, UsageSummary { v1: 4, ..UsageSummary::default() });
        assert_eq!(p.total.v1, 7);
        p.remove_line(10);
        assert_eq!(p.total.v1, 4);
    }

    #[test]
    fn documents_encode_compactly() {
        let group = Group {
            id: 3,
            host: Some(1),
            hosting_end: None,
            volume: 12,
            data: vec![9; 4],
        };
        let bytes = group.encode().unwrap();
        let row = StoredRow {
            collection: Collection::Groups,
            id: 3,
            sub: 0,
            v: 1,
            date: None,
            deleted: false,
            data: bytes,
        };
        assert_eq!(Group::decode(&row).unwrap(), group);
    }
}
