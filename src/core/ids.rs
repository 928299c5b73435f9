// ============================================================================
// Numeric identifiers
// ============================================================================
//
// id = ns * 1e14 + local, 0 <= local < 1e14
//
// The digit of `local` at the 1e13 place is a type tag:
//   0 = partition ("tribe"), 1 = account / primary avatar,
//   2 = secondary avatar,    3 = group
// `local % 1e13 == 0` marks the tenant's single accountable entity.
//
// A tenant record uses its bare `ns` as id; `ns` starts at 1 so the two
// id spaces never overlap.
// ============================================================================

use super::{EngineError, Result};

pub const NS_FACTOR: i64 = 100_000_000_000_000;
pub const TAG_FACTOR: i64 = 10_000_000_000_000;
pub const MAX_NS: i64 = 90_000;

pub const TAG_PARTITION: i64 = 0;
pub const TAG_ACCOUNT: i64 = 1;
pub const TAG_AVATAR: i64 = 2;
pub const TAG_GROUP: i64 = 3;

/// Kind of major entity implied by an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdKind {
    Tenant,
    Partition,
    Account,
    Avatar,
    Group,
    Other,
}

pub struct Id;

impl Id {
    pub fn make(ns: i64, tag: i64, n: i64) -> Result<i64> {
        if !(1..MAX_NS).contains(&ns) || !(0..10).contains(&tag) || !(0..TAG_FACTOR).contains(&n) {
            return Err(EngineError::assertion(
                crate::core::codes::MISSING_ENTITY,
                format!("invalid id parts ns={} tag={} n={}", ns, tag, n),
            ));
        }
        Ok(ns * NS_FACTOR + tag * TAG_FACTOR + n)
    }

    pub fn ns(id: i64) -> i64 {
        if Self::is_tenant(id) { id } else { id / NS_FACTOR }
    }

    pub fn local(id: i64) -> i64 {
        id % NS_FACTOR
    }

    pub fn tag(id: i64) -> i64 {
        Self::local(id) / TAG_FACTOR
    }

    pub fn is_tenant(id: i64) -> bool {
        (1..MAX_NS).contains(&id)
    }

    pub fn is_partition(id: i64) -> bool {
        !Self::is_tenant(id) && Self::tag(id) == TAG_PARTITION
    }

    /// Tags below the group tag (other than the partition tag) are avatar variants.
    pub fn is_avatar(id: i64) -> bool {
        !Self::is_tenant(id) && Self::tag(id) > TAG_PARTITION && Self::tag(id) < TAG_GROUP
    }

    pub fn is_account(id: i64) -> bool {
        !Self::is_tenant(id) && Self::tag(id) == TAG_ACCOUNT
    }

    pub fn is_group(id: i64) -> bool {
        !Self::is_tenant(id) && Self::tag(id) == TAG_GROUP
    }

    pub fn is_accountable(id: i64) -> bool {
        !Self::is_tenant(id) && Self::local(id) % TAG_FACTOR == 0
    }

    pub fn kind(id: i64) -> IdKind {
        if Self::is_tenant(id) {
            return IdKind::Tenant;
        }
        match Self::tag(id) {
            TAG_PARTITION => IdKind::Partition,
            TAG_ACCOUNT => IdKind::Account,
            TAG_AVATAR => IdKind::Avatar,
            TAG_GROUP => IdKind::Group,
            _ => IdKind::Other,
        }
    }

    /// Half-open id interval covering every entity of tenant `ns`.
    pub fn tenant_range(ns: i64) -> (i64, i64) {
        (ns * NS_FACTOR, (ns + 1) * NS_FACTOR)
    }

    /// Half-open id interval covering every entity of one tag in tenant `ns`.
    pub fn kind_range(ns: i64, tag: i64) -> (i64, i64) {
        let lo = ns * NS_FACTOR + tag * TAG_FACTOR;
        (lo, lo + TAG_FACTOR)
    }

    /// Interval containing every tenant record id.
    pub fn tenant_records_range() -> (i64, i64) {
        (1, MAX_NS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_recovers_tenant() {
        let id = 21 * NS_FACTOR + 30_000_000_000_000;
        assert!(Id::is_group(id));
        assert_eq!(Id::ns(id), 21);
        assert!(!Id::is_avatar(id));
    }

    #[test]
    fn accountable_and_kinds() {
        let root = Id::make(5, TAG_ACCOUNT, 0).unwrap();
        assert!(Id::is_accountable(root));
        assert_eq!(Id::kind(root), IdKind::Account);

        let avatar = Id::make(5, TAG_AVATAR, 42).unwrap();
        assert!(Id::is_avatar(avatar));
        assert!(!Id::is_accountable(avatar));

        let partition = Id::make(5, TAG_PARTITION, 7).unwrap();
        assert!(Id::is_partition(partition));
        assert_eq!(Id::kind(5), IdKind::Tenant);
        assert_eq!(Id::ns(5), 5);
    }

    #[test]
    fn ranges_select_one_tenant() {
        let (lo, hi) = Id::tenant_range(3);
        let id = Id::make(3, TAG_GROUP, 9).unwrap();
        assert!(lo <= id && id < hi);
        let (glo, ghi) = Id::kind_range(3, TAG_GROUP);
        assert!(glo <= id && id < ghi);
        let other = Id::make(4, TAG_GROUP, 9).unwrap();
        assert!(other >= hi);
    }

    #[test]
    fn rejects_out_of_range_parts() {
        assert!(Id::make(1, 10, 0).is_err());
        assert!(Id::make(0, 1, 0).is_err());
        assert!(Id::make(1, 1, TAG_FACTOR).is_err());
    }
}
