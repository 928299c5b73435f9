// ============================================================================
// One synchronization round
// ============================================================================
//
// 1. reconcile the perimeter with the account's current avatars and groups
// 2. recompute baselines (every entry on full resync, else hinted + new ones)
// 3. fetch incremental content for at most `budget` entries needing it
// 4. report tombstoned or no longer authorized entities as gone
// Everything is read inside the operation's transaction, so the rows sent
// and the versions recorded in the perimeter are mutually consistent.
// ============================================================================

use super::perimeter::{EntryKind, Perimeter, PerimeterEntry};
use crate::core::{EngineError, Id, Result, codes};
use crate::document::{Account, DocumentManager};
use crate::storage::{Collection, StoredRow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{Level, event};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Perimeter returned by the previous round; `None` on first connection.
    #[serde(default)]
    pub perimeter: Option<Vec<u8>>,
    /// Recompute every baseline.
    #[serde(default)]
    pub full: bool,
    /// Entities the client believes changed (from notifications).
    #[serde(default)]
    pub hints: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReply {
    pub perimeter: Vec<u8>,
    pub rows: Vec<StoredRow>,
    /// Entities the client must drop.
    pub gone: Vec<i64>,
    /// Budget exhausted: another round is needed.
    pub more: bool,
}

/// Entities the account is currently authorized to track.
fn authorized(account: &Account) -> BTreeMap<i64, PerimeterEntry> {
    let mut entries = BTreeMap::new();
    entries.insert(account.id, PerimeterEntry::new(EntryKind::Account));
    for avatar in &account.avatars {
        if *avatar != account.id {
            entries.insert(*avatar, PerimeterEntry::new(EntryKind::Avatar));
        }
    }
    for (group, access) in &account.groups {
        let mut entry = PerimeterEntry::new(EntryKind::Group);
        entry.members_allowed = access.members;
        entry.notes_allowed = access.notes;
        entries.insert(*group, entry);
    }
    entries
}

pub async fn run_round(
    docs: &mut DocumentManager,
    account_id: i64,
    request: &SyncRequest,
    budget: usize,
) -> Result<SyncReply> {
    let first = request.perimeter.is_none();
    let mut perimeter = match &request.perimeter {
        Some(bytes) => Perimeter::decode(bytes, account_id)?,
        None => Perimeter::new(account_id),
    };

    let account = docs.get::<Account>(account_id).await?.cloned().ok_or_else(|| {
        EngineError::functional(
            codes::ACCOUNT_UNKNOWN,
            format!("account {} does not exist", account_id),
        )
    })?;

    // 1. reconcile
    let allowed = authorized(&account);
    let mut gone: BTreeSet<i64> = BTreeSet::new();
    perimeter.entries.retain(|id, _| {
        let keep = allowed.contains_key(id);
        if !keep {
            gone.insert(*id);
        }
        keep
    });
    let mut added = Vec::new();
    for (id, fresh) in &allowed {
        match perimeter.entries.get_mut(id) {
            Some(entry) => {
                entry.members_allowed = fresh.members_allowed;
                entry.notes_allowed = fresh.notes_allowed;
                if !entry.members_allowed {
                    entry.members_loaded = false;
                }
                if !entry.notes_allowed {
                    entry.notes_loaded = false;
                }
            }
            None => {
                perimeter.entries.insert(*id, *fresh);
                added.push(*id);
            }
        }
    }

    // 2. baselines
    let targets: Vec<i64> = if first || request.full {
        perimeter.entries.keys().copied().collect()
    } else {
        let mut ids: BTreeSet<i64> = request
            .hints
            .iter()
            .copied()
            .filter(|id| is_trackable(*id) && perimeter.entries.contains_key(id))
            .collect();
        ids.extend(added.iter().copied());
        ids.into_iter().collect()
    };
    for id in targets {
        match docs.version(id).await? {
            Some(record) if !record.tombstoned => {
                if let Some(entry) = perimeter.entries.get_mut(&id) {
                    entry.baseline = record.v;
                }
            }
            _ => {
                perimeter.entries.remove(&id);
                gone.insert(id);
            }
        }
    }

    // 3. fetch within budget
    let pending: Vec<i64> = perimeter
        .entries
        .iter()
        .filter(|(_, entry)| entry.needs_fetch())
        .map(|(id, _)| *id)
        .collect();
    let more = pending.len() > budget;
    let mut rows = Vec::new();

    for id in pending.into_iter().take(budget) {
        let current = match docs.version(id).await? {
            Some(record) if !record.tombstoned => record.v,
            _ => {
                perimeter.entries.remove(&id);
                gone.insert(id);
                continue;
            }
        };
        let Some(entry) = perimeter.entries.get_mut(&id) else {
            continue;
        };
        fetch_entry(docs, id, entry, &mut rows).await?;
        entry.seen = current;
        entry.baseline = current;
        entry.members_loaded = entry.members_allowed;
        entry.notes_loaded = entry.notes_allowed;
    }

    event!(
        Level::DEBUG,
        account = account_id,
        tracked = perimeter.len(),
        rows = rows.len(),
        gone = gone.len(),
        more,
        "sync round"
    );
    Ok(SyncReply {
        perimeter: perimeter.encode()?,
        rows,
        gone: gone.into_iter().collect(),
        more,
    })
}

async fn fetch_entry(
    docs: &DocumentManager,
    id: i64,
    entry: &PerimeterEntry,
    rows: &mut Vec<StoredRow>,
) -> Result<()> {
    let since = entry.seen;

    for collection in entry.kind.majors() {
        if let Some(row) = docs.major_row(*collection, id).await? {
            if row.v > since {
                rows.push((*row).clone());
            }
        }
    }

    let mut subs: Vec<(Collection, i64)> = entry
        .kind
        .subs()
        .iter()
        .map(|collection| (*collection, since))
        .collect();
    if entry.kind == EntryKind::Group {
        if entry.members_allowed {
            let after = if entry.members_loaded { since } else { 0 };
            subs.push((Collection::Members, after));
        }
        if entry.notes_allowed {
            let after = if entry.notes_loaded { since } else { 0 };
            subs.push((Collection::Notes, after));
        }
    }

    for (collection, after) in subs {
        let children = docs.child_rows(collection, id, after).await?;
        // deletion markers only matter to a client that had the rows
        rows.extend(children.into_iter().filter(|row| after > 0 || !row.deleted));
    }
    Ok(())
}

/// True when `id` can be a perimeter entry at all.
pub fn is_trackable(id: i64) -> bool {
    Id::is_avatar(id) || Id::is_group(id)
}
