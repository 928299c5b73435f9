// ============================================================================
// Operations
// ============================================================================
//
// Every request runs as an `Operation` through the lifecycle:
//   phase1 (no transaction) -> authenticate -> phase2 + write cascade
//   (one backend transaction, retried on conflict) -> post-commit effects
//   and phase3 (never undo the commit) -> result -> throttle.
// ============================================================================

pub mod auth;
pub mod clock;
pub mod context;
pub mod lifecycle;
pub mod notify;
pub mod registry;

pub use auth::{Authenticator, JsonTokenAuthenticator, SessionClaims};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{AuthContext, OpContext};
pub use lifecycle::delete_purged_files;
pub use notify::{BroadcastNotifier, ChangeNotice, NoopNotifier, Notifier};
pub use registry::{OperationFactory, OperationRegistry, parse_args};

use crate::core::Result;
use crate::document::{CommitOutcome, DocumentManager};
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// No token required.
    Public,
    /// Any session of the tenant.
    Authenticated,
    /// The tenant's accountable account (or an admin).
    Privileged,
    /// System-admin key required.
    Admin,
}

/// What to do when the tenant is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrozenPolicy {
    Reject,
    AllowReadOnly,
}

/// Collaborators available after commit.
pub struct PostCommit<'a> {
    pub objects: &'a dyn ObjectStorage,
    pub outcome: &'a CommitOutcome,
}

#[async_trait]
pub trait Operation: Send {
    fn name(&self) -> &str;

    fn access(&self) -> AccessMode {
        AccessMode::Authenticated
    }

    fn frozen_policy(&self) -> FrozenPolicy {
        FrozenPolicy::Reject
    }

    /// Cheap validation before any transaction. Returning a value
    /// short-circuits the run.
    async fn phase1(&mut self, _ctx: &OpContext) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Business logic, through the Document Manager only. Re-run from
    /// scratch after a commit conflict, so it must reset its own state.
    async fn phase2(&mut self, ctx: &OpContext, docs: &mut DocumentManager) -> Result<()>;

    /// Side effects after commit. Errors are logged, not returned.
    async fn phase3(&mut self, _ctx: &OpContext, _post: PostCommit<'_>) -> Result<()> {
        Ok(())
    }

    fn result(&mut self) -> Result<Value> {
        Ok(Value::Null)
    }
}
