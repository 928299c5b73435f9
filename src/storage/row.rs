use crate::core::Day;
use serde::{Deserialize, Serialize};

/// Every collection the engine persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    // Major entities
    Tenants,
    Syntheses,
    Partitions,
    Accounts,
    Usages,
    Avatars,
    Groups,
    // Sub-documents
    Notes,
    Chats,
    Members,
    Tickets,
    Sponsorships,
    // Engine records
    Versions,
    Transfers,
    FilePurges,
    Checkpoints,
}

impl Collection {
    pub const ALL: [Collection; 16] = [
        Collection::Tenants,
        Collection::Syntheses,
        Collection::Partitions,
        Collection::Accounts,
        Collection::Usages,
        Collection::Avatars,
        Collection::Groups,
        Collection::Notes,
        Collection::Chats,
        Collection::Members,
        Collection::Tickets,
        Collection::Sponsorships,
        Collection::Versions,
        Collection::Transfers,
        Collection::FilePurges,
        Collection::Checkpoints,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Tenants => "tenants",
            Collection::Syntheses => "syntheses",
            Collection::Partitions => "partitions",
            Collection::Accounts => "accounts",
            Collection::Usages => "usages",
            Collection::Avatars => "avatars",
            Collection::Groups => "groups",
            Collection::Notes => "notes",
            Collection::Chats => "chats",
            Collection::Members => "members",
            Collection::Tickets => "tickets",
            Collection::Sponsorships => "sponsorships",
            Collection::Versions => "versions",
            Collection::Transfers => "transfers",
            Collection::FilePurges => "file_purges",
            Collection::Checkpoints => "checkpoints",
        }
    }

    /// Top-level documents, one row per id, cached by the read cache.
    pub fn is_major(self) -> bool {
        matches!(
            self,
            Collection::Tenants
                | Collection::Syntheses
                | Collection::Partitions
                | Collection::Accounts
                | Collection::Usages
                | Collection::Avatars
                | Collection::Groups
        )
    }

    /// Child rows addressed by `(major id, sub id)`.
    pub fn is_sub(self) -> bool {
        matches!(
            self,
            Collection::Notes
                | Collection::Chats
                | Collection::Members
                | Collection::Tickets
                | Collection::Sponsorships
        )
    }

    pub fn is_cached(self) -> bool {
        self.is_major() || self == Collection::Versions
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub collection: Collection,
    pub id: i64,
    pub sub: i64,
}

impl RowKey {
    pub fn new(collection: Collection, id: i64, sub: i64) -> Self {
        Self { collection, id, sub }
    }
}

/// Persisted shape shared by every collection: `{id, sub, v, ...payload}`.
/// `date` and `deleted` are the two indexed/flag columns the engine filters on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub collection: Collection,
    pub id: i64,
    /// 0 for major entities.
    pub sub: i64,
    pub v: i64,
    pub date: Option<Day>,
    /// Tombstone on version records, deletion marker on sub-documents.
    pub deleted: bool,
    /// Opaque payload (MessagePack of the typed document).
    pub data: Vec<u8>,
}

impl StoredRow {
    pub fn key(&self) -> RowKey {
        RowKey::new(self.collection, self.id, self.sub)
    }
}

/// Predicate used by range/filter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilter {
    /// `lo <= id < hi`
    Ids { lo: i64, hi: i64 },
    /// Rows under `parent` with `v > after_v`.
    Children { parent: i64, after_v: i64 },
    /// `lo <= date < hi`
    Dates { lo: Day, hi: Day },
}

impl RowFilter {
    pub fn matches(&self, row: &StoredRow) -> bool {
        match *self {
            RowFilter::Ids { lo, hi } => row.id >= lo && row.id < hi,
            RowFilter::Children { parent, after_v } => row.id == parent && row.v > after_v,
            RowFilter::Dates { lo, hi } => row.date.is_some_and(|d| d >= lo && d < hi),
        }
    }
}
