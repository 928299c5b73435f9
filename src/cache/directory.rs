//! Tenant directory: org code to tenant record, refreshed lazily.

use crate::core::{Id, Result};
use crate::document::{Document, Tenant};
use crate::storage::{Collection, CommitReport, RowSource, StoredRow};
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{Level, event};

struct DirectoryEntry {
    v: i64,
    tenant: Arc<Tenant>,
}

#[derive(Default)]
struct DirectoryState {
    tenants: HashMap<i64, DirectoryEntry>,
    by_org: HashMap<String, i64>,
    loaded_at: Option<Instant>,
}

impl DirectoryState {
    fn put(&mut self, v: i64, tenant: Tenant) {
        if let Some(previous) = self.tenants.get(&tenant.ns) {
            if previous.tenant.org != tenant.org {
                self.by_org.remove(&previous.tenant.org);
            }
        }
        self.by_org.insert(tenant.org.clone(), tenant.ns);
        self.tenants.insert(
            tenant.ns,
            DirectoryEntry {
                v,
                tenant: Arc::new(tenant),
            },
        );
    }

    fn remove(&mut self, ns: i64) {
        if let Some(previous) = self.tenants.remove(&ns) {
            self.by_org.remove(&previous.tenant.org);
        }
    }

    /// Whether a committed row at version `v` supersedes the loaded entry.
    fn is_newer(&self, ns: i64, v: i64) -> bool {
        self.tenants.get(&ns).is_none_or(|entry| entry.v < v)
    }
}

pub struct TenantDirectory {
    state: RwLock<DirectoryState>,
    ttl: Duration,
    min_reload: Duration,
}

impl TenantDirectory {
    pub fn new(ttl: Duration, min_reload: Duration) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            ttl,
            min_reload,
        }
    }

    /// Reloads every tenant record from `source`.
    pub async fn refresh(&self, source: &dyn RowSource) -> Result<usize> {
        let (lo, hi) = Id::tenant_records_range();
        let rows = source.scan_ids(Collection::Tenants, lo, hi).await?;

        let mut fresh = DirectoryState::default();
        for row in &rows {
            match Tenant::decode(row) {
                Ok(tenant) => fresh.put(row.v, tenant),
                Err(err) => warn!("skipping undecodable tenant record {}: {}", row.id, err),
            }
        }
        fresh.loaded_at = Some(Instant::now());
        let count = fresh.tenants.len();
        *self.state.write()? = fresh;

        event!(Level::DEBUG, tenants = count, "tenant directory refreshed");
        Ok(count)
    }

    fn is_stale(&self) -> Result<bool> {
        let state = self.state.read()?;
        Ok(match state.loaded_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        })
    }

    pub async fn refresh_if_stale(&self, source: &dyn RowSource) -> Result<bool> {
        if self.is_stale()? {
            self.refresh(source).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolves an org code. An unknown org forces a reload, so tenants
    /// created by another process become visible without waiting for the TTL;
    /// forced reloads are at least `min_reload` apart.
    pub async fn by_org(&self, source: &dyn RowSource, org: &str) -> Result<Option<Arc<Tenant>>> {
        let refreshed = self.refresh_if_stale(source).await?;
        if let Some(tenant) = self.lookup_org(org)? {
            return Ok(Some(tenant));
        }
        if refreshed {
            return Ok(None);
        }
        if !self.may_force_reload()? {
            event!(Level::DEBUG, org, "unknown org; directory reloaded too recently");
            return Ok(None);
        }
        self.refresh(source).await?;
        self.lookup_org(org)
    }

    pub async fn get(&self, source: &dyn RowSource, ns: i64) -> Result<Option<Arc<Tenant>>> {
        self.refresh_if_stale(source).await?;
        Ok(self
            .state
            .read()?
            .tenants
            .get(&ns)
            .map(|entry| entry.tenant.clone()))
    }

    fn may_force_reload(&self) -> Result<bool> {
        let state = self.state.read()?;
        Ok(state
            .loaded_at
            .is_none_or(|at| at.elapsed() >= self.min_reload))
    }

    fn lookup_org(&self, org: &str) -> Result<Option<Arc<Tenant>>> {
        let state = self.state.read()?;
        Ok(state
            .by_org
            .get(org)
            .and_then(|ns| state.tenants.get(ns))
            .map(|entry| entry.tenant.clone()))
    }

    /// Keeps the directory current with tenant records committed locally.
    pub fn apply_commit(&self, report: &CommitReport) -> Result<()> {
        let tenant_rows: Vec<&StoredRow> = report
            .written
            .iter()
            .filter(|row| row.collection == Collection::Tenants)
            .collect();
        let removed: Vec<i64> = report
            .deleted
            .iter()
            .filter(|key| key.collection == Collection::Tenants)
            .map(|key| key.id)
            .collect();
        if tenant_rows.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write()?;
        for row in tenant_rows {
            if !state.is_newer(row.id, row.v) {
                continue;
            }
            if row.deleted {
                state.remove(row.id);
                continue;
            }
            match Tenant::decode(row) {
                Ok(tenant) => state.put(row.v, tenant),
                Err(err) => warn!("skipping undecodable tenant record {}: {}", row.id, err),
            }
        }
        for ns in removed {
            state.remove(ns);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.tenants.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryBackend, StorageBackend};

    fn tenant_row(ns: i64, org: &str) -> StoredRow {
        let tenant = Tenant {
            ns,
            org: org.to_string(),
            closed: false,
            frozen: false,
            notice: None,
        };
        StoredRow {
            collection: Collection::Tenants,
            id: ns,
            sub: 0,
            v: 1,
            date: None,
            deleted: false,
            data: tenant.encode().unwrap(),
        }
    }

    #[tokio::test]
    async fn unknown_org_forces_reload() {
        let backend = InMemoryBackend::new();
        let directory = TenantDirectory::new(Duration::from_secs(3600), Duration::ZERO);
        assert_eq!(directory.refresh(&backend).await.unwrap(), 0);

        let mut txn = backend.begin().await.unwrap();
        txn.insert(tenant_row(7, "acme"));
        txn.commit().await.unwrap();

        let tenant = directory.by_org(&backend, "acme").await.unwrap().unwrap();
        assert_eq!(tenant.ns, 7);
        assert!(directory.by_org(&backend, "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applies_local_commits() {
        let backend = InMemoryBackend::new();
        let directory = TenantDirectory::new(Duration::from_secs(3600), Duration::ZERO);
        directory.refresh(&backend).await.unwrap();

        let mut txn = backend.begin().await.unwrap();
        txn.insert(tenant_row(3, "demo"));
        let report = txn.commit().await.unwrap();
        directory.apply_commit(&report).unwrap();

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get(&backend, 3).await.unwrap().unwrap().org, "demo");
    }

    #[tokio::test]
    async fn forced_reloads_are_spaced_out() {
        let backend = InMemoryBackend::new();
        let directory = TenantDirectory::new(Duration::from_secs(3600), Duration::from_secs(60));
        directory.refresh(&backend).await.unwrap();

        let mut txn = backend.begin().await.unwrap();
        txn.insert(tenant_row(7, "acme"));
        txn.commit().await.unwrap();

        // loaded a moment ago: an unknown org does not trigger a scan
        assert!(directory.by_org(&backend, "acme").await.unwrap().is_none());
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn older_commits_do_not_replace_entries() {
        let backend = InMemoryBackend::new();
        let directory = TenantDirectory::new(Duration::from_secs(3600), Duration::ZERO);

        let mut txn = backend.begin().await.unwrap();
        let mut renamed = tenant_row(3, "renamed");
        renamed.v = 2;
        txn.insert(renamed);
        txn.commit().await.unwrap();
        directory.refresh(&backend).await.unwrap();

        let stale = CommitReport {
            written: vec![tenant_row(3, "demo")],
            ..CommitReport::default()
        };
        directory.apply_commit(&stale).unwrap();
        assert_eq!(directory.get(&backend, 3).await.unwrap().unwrap().org, "renamed");
        assert!(directory.by_org(&backend, "demo").await.unwrap().is_none());
    }
}
