// ============================================================================
// GC steps
// ============================================================================
//
// Every step selects candidates with a committed-state scan, then handles
// each candidate in its own internal operation that re-reads the row inside
// the transaction before acting on it: a concurrent write may have revived
// or changed it since the scan.
// ============================================================================

use super::checkpoint::StepStats;
use crate::config::GcPolicy;
use crate::core::days::{MIN_DAY, minus_days, plus_days, restamp_far};
use crate::core::{Day, Id, IdKind, Result};
use crate::document::{
    Document, DocumentManager, FilePurge, Group, Member, Partition, Sponsorship, Transfer, Usage,
};
use crate::engine::Engine;
use crate::operation::{OpContext, Operation, delete_purged_files};
use crate::storage::{Collection, RowSource};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStep {
    HostingExpiry,
    OrphanMembers,
    Purge,
    AbandonedTransfers,
    FilePurges,
    OldTombstones,
}

impl GcStep {
    pub const ALL: [GcStep; 6] = [
        GcStep::HostingExpiry,
        GcStep::OrphanMembers,
        GcStep::Purge,
        GcStep::AbandonedTransfers,
        GcStep::FilePurges,
        GcStep::OldTombstones,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GcStep::HostingExpiry => "hosting_expiry",
            GcStep::OrphanMembers => "orphan_members",
            GcStep::Purge => "purge",
            GcStep::AbandonedTransfers => "abandoned_transfers",
            GcStep::FilePurges => "file_purges",
            GcStep::OldTombstones => "old_tombstones",
        }
    }

    pub(crate) async fn run(self, engine: &Engine, policy: &GcPolicy, today: Day) -> Result<StepStats> {
        let mut stats = StepStats::new();
        match self {
            GcStep::HostingExpiry => hosting_expiry(engine, today, &mut stats).await?,
            GcStep::OrphanMembers => orphan_members(engine, today, &mut stats).await?,
            GcStep::Purge => purge(engine, policy, today, &mut stats).await?,
            GcStep::AbandonedTransfers => abandoned_transfers(engine, today, &mut stats).await?,
            GcStep::FilePurges => file_purges(engine, &mut stats).await?,
            GcStep::OldTombstones => old_tombstones(engine, policy, today, &mut stats).await?,
        }
        event!(Level::DEBUG, step = self.name(), stats = ?stats, "gc step done");
        Ok(stats)
    }
}

fn bump(stats: &mut StepStats, key: &str, n: u64) {
    *stats.entry(key.to_string()).or_insert(0) += n;
}

/// Entity rows that live under the entity's own id, by id kind.
fn majors_of(kind: IdKind) -> &'static [Collection] {
    match kind {
        IdKind::Tenant => &[Collection::Tenants, Collection::Syntheses],
        IdKind::Partition => &[Collection::Partitions],
        IdKind::Account => &[Collection::Accounts, Collection::Usages, Collection::Avatars],
        IdKind::Avatar => &[Collection::Avatars],
        IdKind::Group => &[Collection::Groups],
        IdKind::Other => &[],
    }
}

fn subs_of(kind: IdKind) -> &'static [Collection] {
    match kind {
        IdKind::Partition => &[Collection::Sponsorships],
        IdKind::Account => &[Collection::Notes, Collection::Chats, Collection::Tickets],
        IdKind::Avatar => &[Collection::Notes, Collection::Chats],
        IdKind::Group => &[Collection::Members, Collection::Notes],
        IdKind::Tenant | IdKind::Other => &[],
    }
}

// ----------------------------------------------------------------------------
// 1. hosting expiry
// ----------------------------------------------------------------------------

async fn hosting_expiry(engine: &Engine, today: Day, stats: &mut StepStats) -> Result<()> {
    let rows = engine
        .backend()
        .scan_dates(Collection::Groups, MIN_DAY, today)
        .await?;
    bump(stats, "scanned", rows.len() as u64);
    for row in rows.iter().filter(|row| !row.deleted) {
        let mut op = ExpireHosting {
            group: row.id,
            tombstoned: false,
        };
        engine.run_internal(&mut op).await?;
        if op.tombstoned {
            bump(stats, "tombstoned", 1);
        }
    }
    Ok(())
}

struct ExpireHosting {
    group: i64,
    tombstoned: bool,
}

#[async_trait]
impl Operation for ExpireHosting {
    fn name(&self) -> &str {
        "gc.expire_hosting"
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.tombstoned = false;
        let expired = docs
            .get::<Group>(self.group)
            .await?
            .and_then(|group| group.hosting_end)
            .is_some_and(|end| end < ctx.today);
        if expired {
            self.tombstoned = docs.tombstone(self.group).await?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 2. orphan members
// ----------------------------------------------------------------------------

async fn orphan_members(engine: &Engine, today: Day, stats: &mut StepStats) -> Result<()> {
    let rows = engine
        .backend()
        .scan_dates(Collection::Members, MIN_DAY, today)
        .await?;
    let groups: BTreeSet<i64> = rows.iter().filter(|row| !row.deleted).map(|row| row.id).collect();
    bump(stats, "scanned", rows.len() as u64);
    for group in groups {
        let mut op = RemoveExpiredMembers {
            group,
            removed: 0,
            tombstoned: false,
        };
        engine.run_internal(&mut op).await?;
        bump(stats, "members_removed", op.removed);
        if op.tombstoned {
            bump(stats, "groups_tombstoned", 1);
        }
    }
    Ok(())
}

struct RemoveExpiredMembers {
    group: i64,
    removed: u64,
    tombstoned: bool,
}

#[async_trait]
impl Operation for RemoveExpiredMembers {
    fn name(&self) -> &str {
        "gc.remove_expired_members"
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.removed = 0;
        self.tombstoned = false;
        let members = docs.list_subs::<Member>(self.group).await?;
        if members.is_empty() {
            return Ok(());
        }
        let mut active = 0usize;
        for member in &members {
            if member.expires.is_some_and(|day| day < ctx.today) {
                if docs.delete_sub::<Member>(member.id, member.sub).await? {
                    self.removed += 1;
                }
            } else {
                active += 1;
            }
        }
        if active == 0 {
            self.tombstoned = docs.tombstone(self.group).await?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3. physical purge
// ----------------------------------------------------------------------------

async fn purge(engine: &Engine, policy: &GcPolicy, today: Day, stats: &mut StepStats) -> Result<()> {
    let lo = minus_days(today, policy.purge_window_days);
    let rows = engine
        .backend()
        .scan_dates(Collection::Versions, lo, plus_days(today, 1))
        .await?;
    bump(stats, "scanned", rows.len() as u64);
    for row in rows.iter().filter(|row| row.deleted) {
        let mut op = PurgeEntity {
            id: row.id,
            window_start: lo,
            far_offset: policy.far_future_offset_days,
            purged: false,
        };
        engine.run_internal(&mut op).await?;
        if op.purged {
            bump(stats, "purged", 1);
        }
    }
    Ok(())
}

struct PurgeEntity {
    id: i64,
    window_start: Day,
    far_offset: u64,
    purged: bool,
}

impl PurgeEntity {
    /// Gives the volume of a tombstoned account or group back to whoever
    /// carried it. The entity rows go away in the same transaction, so a
    /// second pass finds nothing to reclaim.
    async fn reclaim(&self, docs: &mut DocumentManager, kind: IdKind) -> Result<()> {
        match kind {
            IdKind::Account => {
                let Some(row) = docs.major_row(Collection::Usages, self.id).await? else {
                    return Ok(());
                };
                let Some(partition) = Usage::decode(&row)?.partition else {
                    return Ok(());
                };
                let has_line = docs
                    .get::<Partition>(partition)
                    .await?
                    .is_some_and(|p| p.accounts.contains_key(&self.id));
                if has_line {
                    if let Some(p) = docs.get_mut::<Partition>(partition).await? {
                        p.remove_line(self.id);
                    }
                }
            }
            IdKind::Group => {
                let Some(row) = docs.major_row(Collection::Groups, self.id).await? else {
                    return Ok(());
                };
                let group = Group::decode(&row)?;
                let (Some(host), volume) = (group.host, group.volume) else {
                    return Ok(());
                };
                if volume == 0 {
                    return Ok(());
                }
                let today = docs.today();
                if let Some(usage) = docs.get_mut::<Usage>(host).await? {
                    usage.counters.add_v2(-(volume as i64), today);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Operation for PurgeEntity {
    fn name(&self) -> &str {
        "gc.purge"
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.purged = false;
        let Some(record) = docs.version(self.id).await? else {
            return Ok(());
        };
        let Some(date) = record.date else {
            return Ok(());
        };
        if !record.tombstoned || date > ctx.today || date < self.window_start {
            return Ok(());
        }

        let kind = Id::kind(self.id);
        self.reclaim(docs, kind).await?;
        for collection in subs_of(kind) {
            docs.purge_children(*collection, self.id)?;
        }
        for collection in majors_of(kind) {
            docs.purge_row(*collection, self.id, 0)?;
        }
        if matches!(kind, IdKind::Account | IdKind::Avatar | IdKind::Group) {
            docs.schedule_file_purge(self.id, None).await?;
        }
        docs.restamp_version(self.id, Some(restamp_far(date, self.far_offset)))
            .await?;
        self.purged = true;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 4. abandoned transfers
// ----------------------------------------------------------------------------

async fn abandoned_transfers(engine: &Engine, today: Day, stats: &mut StepStats) -> Result<()> {
    let rows = engine
        .backend()
        .scan_dates(Collection::Transfers, MIN_DAY, today)
        .await?;
    bump(stats, "scanned", rows.len() as u64);
    for row in &rows {
        let mut op = AbandonTransfer {
            owner: row.id,
            sub: row.sub,
            abandoned: false,
        };
        engine.run_internal(&mut op).await?;
        if op.abandoned {
            bump(stats, "abandoned", 1);
        }
    }
    Ok(())
}

/// Turns an expired transfer into a file-purge intent in one transaction;
/// the files are deleted after commit (or by the next step on failure).
struct AbandonTransfer {
    owner: i64,
    sub: i64,
    abandoned: bool,
}

#[async_trait]
impl Operation for AbandonTransfer {
    fn name(&self) -> &str {
        "gc.abandon_transfer"
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.abandoned = false;
        let Some(transfer) = docs.get_sub::<Transfer>(self.owner, self.sub).await?.cloned() else {
            return Ok(());
        };
        if transfer.expires >= ctx.today {
            return Ok(());
        }
        docs.delete_sub::<Transfer>(self.owner, self.sub).await?;
        if !transfer.files.is_empty() {
            docs.schedule_file_purge(transfer.owner, Some(transfer.files))
                .await?;
        }
        self.abandoned = true;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5. deferred file purges
// ----------------------------------------------------------------------------

async fn file_purges(engine: &Engine, stats: &mut StepStats) -> Result<()> {
    let rows = engine
        .backend()
        .scan_ids(Collection::FilePurges, i64::MIN, i64::MAX)
        .await?;
    bump(stats, "scanned", rows.len() as u64);
    for row in &rows {
        let purge = FilePurge::decode(row)?;
        delete_purged_files(&**engine.objects(), &purge).await?;
        let mut op = DropIntent {
            owner: purge.owner,
            sub: purge.sub,
        };
        engine.run_internal(&mut op).await?;
        bump(stats, "drained", 1);
    }
    Ok(())
}

struct DropIntent {
    owner: i64,
    sub: i64,
}

#[async_trait]
impl Operation for DropIntent {
    fn name(&self) -> &str {
        "gc.drop_file_purge"
    }

    async fn phase2(&mut self, _ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        docs.delete_sub::<FilePurge>(self.owner, self.sub).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 6. old tombstones and expired invitations
// ----------------------------------------------------------------------------

async fn old_tombstones(
    engine: &Engine,
    policy: &GcPolicy,
    today: Day,
    stats: &mut StepStats,
) -> Result<()> {
    // purged records sit past today + offset/2; live purge dates never do
    let lo = plus_days(today, policy.far_future_offset_days / 2);
    let hi = restamp_far(
        minus_days(today, policy.version_retention_days),
        policy.far_future_offset_days,
    );
    let rows = if lo < hi {
        engine
            .backend()
            .scan_dates(Collection::Versions, lo, hi)
            .await?
    } else {
        Vec::new()
    };
    bump(stats, "scanned", rows.len() as u64);
    for row in rows.iter().filter(|row| row.deleted) {
        let mut op = RemoveVersion {
            id: row.id,
            lo,
            hi,
            removed: false,
        };
        engine.run_internal(&mut op).await?;
        if op.removed {
            bump(stats, "versions_removed", 1);
        }
    }

    let invitations = engine
        .backend()
        .scan_dates(Collection::Sponsorships, MIN_DAY, today)
        .await?;
    for row in &invitations {
        let mut op = DropInvitation {
            partition: row.id,
            sub: row.sub,
            dropped: false,
        };
        engine.run_internal(&mut op).await?;
        if op.dropped {
            bump(stats, "invitations_removed", 1);
        }
    }
    Ok(())
}

struct RemoveVersion {
    id: i64,
    lo: Day,
    hi: Day,
    removed: bool,
}

#[async_trait]
impl Operation for RemoveVersion {
    fn name(&self) -> &str {
        "gc.remove_version"
    }

    async fn phase2(&mut self, _ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.removed = false;
        let Some(record) = docs.version(self.id).await? else {
            return Ok(());
        };
        let in_window = record.date.is_some_and(|date| date >= self.lo && date < self.hi);
        if record.tombstoned && in_window {
            docs.remove_version(self.id).await?;
            self.removed = true;
        }
        Ok(())
    }
}

struct DropInvitation {
    partition: i64,
    sub: i64,
    dropped: bool,
}

#[async_trait]
impl Operation for DropInvitation {
    fn name(&self) -> &str {
        "gc.drop_invitation"
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.dropped = false;
        let row = docs
            .child_rows(Collection::Sponsorships, self.partition, 0)
            .await?
            .into_iter()
            .find(|row| row.sub == self.sub);
        let Some(row) = row else {
            return Ok(());
        };
        let expired = row.deleted || Sponsorship::decode(&row)?.expires < ctx.today;
        if expired {
            docs.purge_row(Collection::Sponsorships, self.partition, self.sub)?;
            self.dropped = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::TAG_ACCOUNT;
    use crate::document::Account;
    use crate::operation::ManualClock;
    use crate::storage::InMemoryBackend;
    use chrono::NaiveDate;
    use std::sync::Arc;

    struct AddAccount(i64);

    #[async_trait]
    impl Operation for AddAccount {
        fn name(&self) -> &str {
            "test.add_account"
        }

        async fn phase2(&mut self, _ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
            docs.create(Account::new(self.0, None)).await?;
            Ok(())
        }
    }

    struct Tombstone(i64);

    #[async_trait]
    impl Operation for Tombstone {
        fn name(&self) -> &str {
            "test.tombstone"
        }

        async fn phase2(&mut self, _ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
            docs.tombstone(self.0).await?;
            Ok(())
        }
    }

    fn purge_op(id: i64) -> PurgeEntity {
        PurgeEntity {
            id,
            window_start: MIN_DAY,
            far_offset: 1_000_000,
            purged: false,
        }
    }

    async fn setup() -> (Engine, InMemoryBackend, Arc<ManualClock>, i64) {
        let backend = InMemoryBackend::new();
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let clock = Arc::new(ManualClock::at_day(day));
        let engine = Engine::builder()
            .backend(Arc::new(backend.clone()))
            .clock(clock.clone())
            .build()
            .unwrap();
        let id = Id::make(7, TAG_ACCOUNT, 1).unwrap();
        engine.run_internal(&mut AddAccount(id)).await.unwrap();
        (engine, backend, clock, id)
    }

    #[tokio::test]
    async fn purge_rechecks_live_entities() {
        let (engine, backend, _clock, id) = setup().await;

        let mut op = purge_op(id);
        engine.run_internal(&mut op).await.unwrap();
        assert!(!op.purged);
        assert!(backend.get(Collection::Accounts, id, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_rechecks_the_purge_date() {
        let (engine, backend, clock, id) = setup().await;
        engine.run_internal(&mut Tombstone(id)).await.unwrap();

        // tombstoned, but its purge date has not come yet
        let mut op = purge_op(id);
        engine.run_internal(&mut op).await.unwrap();
        assert!(!op.purged);
        assert!(backend.get(Collection::Accounts, id, 0).await.unwrap().is_some());

        clock.advance_days(2);
        let mut op = purge_op(id);
        engine.run_internal(&mut op).await.unwrap();
        assert!(op.purged);
        assert!(backend.get(Collection::Accounts, id, 0).await.unwrap().is_none());
    }
}
