//! Post-commit broadcast of changed versions to subscribed sessions.

use crate::core::{Id, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Versions bumped by one committed operation within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub ns: i64,
    /// `(version id, v)` pairs.
    pub versions: Vec<(i64, i64)>,
}

impl ChangeNotice {
    /// Splits a commit's changed versions per tenant.
    pub fn group_by_tenant(changed: &[(i64, i64)]) -> Vec<ChangeNotice> {
        let mut by_ns: BTreeMap<i64, Vec<(i64, i64)>> = BTreeMap::new();
        for (id, v) in changed {
            let ns = if Id::is_tenant(*id) { *id } else { Id::ns(*id) };
            by_ns.entry(ns).or_default().push((*id, *v));
        }
        by_ns
            .into_iter()
            .map(|(ns, versions)| ChangeNotice { ns, versions })
            .collect()
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: ChangeNotice) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notice: ChangeNotice) -> Result<()> {
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel. Having no subscriber
/// is not an error.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ChangeNotice>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notice: ChangeNotice) -> Result<()> {
        let _ = self.tx.send(notice);
        Ok(())
    }
}
