use crate::core::Result;
use crate::document::{Document, DocumentManager};
use crate::operation::{OpContext, Operation};
use crate::storage::Collection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id of the singleton checkpoint row.
pub const CHECKPOINT_ID: i64 = 1;

pub type StepStats = BTreeMap<String, u64>;

/// One attempt of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub stats: StepStats,
    pub error: Option<String>,
}

/// Log of the most recent GC run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Every step succeeded.
    pub completed: bool,
    /// Step that exhausted its retries.
    pub aborted_at: Option<String>,
    pub log: Vec<StepLog>,
}

impl Checkpoint {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Self::default()
        }
    }

    pub fn last_error(&self) -> Option<&StepLog> {
        self.log.iter().rev().find(|entry| entry.error.is_some())
    }

    pub fn stat(&self, step: &str, key: &str) -> u64 {
        self.log
            .iter()
            .filter(|entry| entry.step == step && entry.error.is_none())
            .filter_map(|entry| entry.stats.get(key))
            .sum()
    }
}

impl Document for Checkpoint {
    const COLLECTION: Collection = Collection::Checkpoints;
    const VERSIONED: bool = false;

    fn id(&self) -> i64 {
        CHECKPOINT_ID
    }
}

/// Overwrites the checkpoint row.
pub(crate) struct SaveCheckpoint {
    pub(crate) checkpoint: Checkpoint,
}

#[async_trait]
impl Operation for SaveCheckpoint {
    fn name(&self) -> &str {
        "gc.checkpoint"
    }

    async fn phase2(&mut self, _ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        match docs.get_mut::<Checkpoint>(CHECKPOINT_ID).await? {
            Some(current) => *current = self.checkpoint.clone(),
            None => {
                docs.create(self.checkpoint.clone()).await?;
            }
        }
        Ok(())
    }
}
