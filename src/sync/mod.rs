// ============================================================================
// Incremental synchronization
// ============================================================================

pub mod perimeter;
pub mod round;

pub use perimeter::{EntryKind, Perimeter, PerimeterEntry};
pub use round::{SyncReply, SyncRequest, run_round};

use crate::core::Result;
use crate::document::DocumentManager;
use crate::operation::{FrozenPolicy, OpContext, Operation, parse_args};
use async_trait::async_trait;
use serde_json::Value;

pub const SYNC_OPERATION: &str = "Sync";

/// Built-in operation running one sync round for the caller's account.
/// Read-only: allowed on frozen tenants.
pub struct SyncOperation {
    request: SyncRequest,
    budget: usize,
    reply: Option<SyncReply>,
}

impl SyncOperation {
    pub fn new(request: SyncRequest, budget: usize) -> Self {
        Self {
            request,
            budget: budget.max(1),
            reply: None,
        }
    }

    pub fn from_args(args: Value, budget: usize) -> Result<Self> {
        Ok(Self::new(parse_args(SYNC_OPERATION, args)?, budget))
    }

    pub fn take_reply(&mut self) -> Option<SyncReply> {
        self.reply.take()
    }
}

#[async_trait]
impl Operation for SyncOperation {
    fn name(&self) -> &str {
        SYNC_OPERATION
    }

    fn frozen_policy(&self) -> FrozenPolicy {
        FrozenPolicy::AllowReadOnly
    }

    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()> {
        let account = ctx.require_account()?;
        self.reply = Some(run_round(docs, account, &self.request, self.budget).await?);
        Ok(())
    }

    fn result(&mut self) -> Result<Value> {
        Ok(serde_json::to_value(self.reply.take().unwrap_or_default())?)
    }
}
