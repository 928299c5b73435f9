#![allow(dead_code)]

use chrono::NaiveDate;
use futures::future::BoxFuture;
use std::sync::Arc;
use tenantdoc::core::ids::{TAG_ACCOUNT, TAG_AVATAR, TAG_GROUP, TAG_PARTITION};
use tenantdoc::core::{Counters, Day, Id, Result};
use tenantdoc::document::{
    Account, Avatar, Document, DocumentManager, Group, GroupAccess, Member, Partition, Tenant,
    Usage, VersionRecord,
};
use tenantdoc::operation::{
    AccessMode, BroadcastNotifier, FrozenPolicy, JsonTokenAuthenticator, ManualClock, OpContext,
    Operation, SessionClaims,
};
use tenantdoc::storage::{Collection, InMemoryBackend, MemoryObjectStorage, RowSource, StoredRow};
use tenantdoc::{Engine, EngineConfig};

pub const NS: i64 = 12;
pub const ORG: &str = "acme";
pub const ADMIN_KEY: &str = "root-key";

pub fn day(y: i32, m: u32, d: u32) -> Day {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn start_day() -> Day {
    day(2026, 3, 10)
}

pub fn partition() -> i64 {
    Id::make(NS, TAG_PARTITION, 1).unwrap()
}

/// The tenant's accountable account.
pub fn accountable() -> i64 {
    Id::make(NS, TAG_ACCOUNT, 0).unwrap()
}

pub fn account(n: i64) -> i64 {
    Id::make(NS, TAG_ACCOUNT, n).unwrap()
}

pub fn avatar(n: i64) -> i64 {
    Id::make(NS, TAG_AVATAR, n).unwrap()
}

pub fn group(n: i64) -> i64 {
    Id::make(NS, TAG_GROUP, n).unwrap()
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.gc.step_backoffs_ms = vec![0, 0];
    config.throttle.delay_ms = 0;
    config.directory.min_reload_secs = 0;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.admin_keys = vec![ADMIN_KEY.to_string()];
    config
}

// ----------------------------------------------------------------------------
// Script operation
// ----------------------------------------------------------------------------

pub type ScriptFn =
    Box<dyn for<'a> FnMut(&'a mut DocumentManager) -> BoxFuture<'a, Result<()>> + Send>;

/// Operation whose phase2 is a closure over the Document Manager.
pub struct Script {
    name: String,
    access: AccessMode,
    frozen: FrozenPolicy,
    phase2: ScriptFn,
    pub caller: Option<i64>,
}

impl Script {
    pub fn new<F>(name: &str, phase2: F) -> Self
    where
        F: for<'a> FnMut(&'a mut DocumentManager) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            access: AccessMode::Authenticated,
            frozen: FrozenPolicy::Reject,
            phase2: Box::new(phase2),
            caller: None,
        }
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn frozen(mut self, frozen: FrozenPolicy) -> Self {
        self.frozen = frozen;
        self
    }
}

#[async_trait::async_trait]
impl Operation for Script {
    fn name(&self) -> &str {
        &self.name
    }

    fn access(&self) -> AccessMode {
        self.access
    }

    fn frozen_policy(&self) -> FrozenPolicy {
        self.frozen
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        self.caller = ctx.account();
        (self.phase2)(docs).await
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub engine: Engine,
    pub backend: InMemoryBackend,
    pub objects: Arc<MemoryObjectStorage>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<BroadcastNotifier>,
}

impl Harness {
    pub async fn internal(&self, mut script: Script) -> Result<()> {
        self.engine.run_internal(&mut script).await.map(|_| ())
    }

    pub async fn as_account(&self, account: i64, mut script: Script) -> Result<()> {
        let token = token(account);
        self.engine.run(&mut script, Some(&token)).await.map(|_| ())
    }

    pub async fn version(&self, id: i64) -> Option<VersionRecord> {
        self.backend
            .get(Collection::Versions, id, 0)
            .await
            .unwrap()
            .map(|row| VersionRecord::from_row(&row))
    }

    pub async fn row(&self, collection: Collection, id: i64, sub: i64) -> Option<StoredRow> {
        self.backend.get(collection, id, sub).await.unwrap()
    }

    pub async fn doc<T: Document>(&self, id: i64, sub: i64) -> Option<T> {
        let row = self.row(T::COLLECTION, id, sub).await?;
        if row.deleted {
            return None;
        }
        Some(T::decode(&row).unwrap())
    }

    /// Adds an account (usage counters, primary avatar) to the seeded partition.
    pub async fn add_account(&self, id: i64) {
        self.internal(Script::new("seed.account", move |docs| {
            Box::pin(async move {
                let p = partition();
                docs.create(Account::new(id, Some(p))).await?;
                docs.create(Usage::new(id, Some(p), Counters::with_quotas(4, 4, 4)))
                    .await?;
                docs.create(Avatar { id, data: Vec::new() }).await?;
                Ok(())
            })
        }))
        .await
        .unwrap();
    }

    /// Adds a group hosted by `host`, with `members` as active members.
    pub async fn add_group(&self, id: i64, host: i64, members: &[i64]) {
        let members = members.to_vec();
        self.internal(Script::new("seed.group", move |docs| {
            let members = members.clone();
            Box::pin(async move {
                docs.create(Group {
                    id,
                    host: Some(host),
                    ..Group::default()
                })
                .await?;
                for (i, member) in members.iter().enumerate() {
                    docs.create(Member {
                        id,
                        sub: i as i64 + 1,
                        avatar: *member,
                        expires: None,
                        data: Vec::new(),
                    })
                    .await?;
                    if let Some(account) = docs.get_mut::<Account>(*member).await? {
                        account.groups.insert(
                            id,
                            GroupAccess {
                                members: true,
                                notes: true,
                            },
                        );
                    }
                }
                Ok(())
            })
        }))
        .await
        .unwrap();
    }
}

pub fn token(account: i64) -> String {
    JsonTokenAuthenticator::token(&SessionClaims {
        org: Some(ORG.to_string()),
        account: Some(account),
        session: Some(format!("s-{}", account)),
        admin_key: None,
    })
    .unwrap()
}

pub fn admin_token() -> String {
    JsonTokenAuthenticator::token(&SessionClaims {
        org: Some(ORG.to_string()),
        account: None,
        session: None,
        admin_key: Some(ADMIN_KEY.to_string()),
    })
    .unwrap()
}

pub async fn harness() -> Harness {
    harness_with(config()).await
}

/// Engine over fresh in-memory storage, seeded with the tenant, one
/// partition, the accountable account and account 1.
pub async fn harness_with(config: EngineConfig) -> Harness {
    let backend = InMemoryBackend::new();
    let objects = Arc::new(MemoryObjectStorage::new());
    let clock = Arc::new(ManualClock::at_day(start_day()));
    let notifier = Arc::new(BroadcastNotifier::new(64));
    let engine = Engine::builder()
        .config(config)
        .backend(Arc::new(backend.clone()))
        .objects(objects.clone())
        .clock(clock.clone())
        .notifier(notifier.clone())
        .build()
        .unwrap();
    let harness = Harness {
        engine,
        backend,
        objects,
        clock,
        notifier,
    };

    harness
        .internal(Script::new("seed.tenant", |docs| {
            Box::pin(async move {
                docs.create(Tenant {
                    ns: NS,
                    org: ORG.to_string(),
                    closed: false,
                    frozen: false,
                    notice: None,
                })
                .await?;
                docs.create(Partition::new(partition())).await?;
                Ok(())
            })
        }))
        .await
        .unwrap();
    harness.add_account(accountable()).await;
    harness.add_account(account(1)).await;
    harness
}
