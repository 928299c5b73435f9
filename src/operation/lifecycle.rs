use super::context::{AuthContext, OpContext};
use super::notify::ChangeNotice;
use super::{AccessMode, FrozenPolicy, Operation, PostCommit};
use crate::core::{AdmissionFlags, EngineError, ErrorCategory, Id, Result, codes};
use crate::document::{CommitOutcome, Document, DocumentManager, FilePurge, Usage};
use crate::engine::Engine;
use crate::storage::{Collection, ObjectStorage, StorageBackend, StorageTxn};
use log::warn;
use serde_json::Value;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

enum Caller<'a> {
    Token(Option<&'a str>),
    /// Engine-initiated runs (GC): no authentication, no caller account.
    Internal,
}

/// Deletes the files named by a purge intent. Idempotent.
pub async fn delete_purged_files(objects: &dyn ObjectStorage, purge: &FilePurge) -> Result<()> {
    match &purge.files {
        Some(files) => objects.delete_files(purge.owner, files).await,
        None => objects.delete_all(purge.owner).await,
    }
}

fn log_failure(name: &str, err: &EngineError) {
    match err.category() {
        ErrorCategory::Functional => {
            event!(Level::DEBUG, operation = name, code = err.code(), error = %err, "operation rejected")
        }
        ErrorCategory::Assertion => {
            event!(Level::ERROR, operation = name, code = err.code(), error = %err, "assertion failed")
        }
        ErrorCategory::Unexpected => {
            event!(Level::ERROR, operation = name, error = ?err, "operation failed")
        }
    }
}

impl Engine {
    /// Runs one operation for a caller identified by `token`.
    pub async fn run(&self, op: &mut dyn Operation, token: Option<&str>) -> Result<Value> {
        self.run_as(op, Caller::Token(token)).await
    }

    /// Runs an engine-initiated operation without authentication.
    pub async fn run_internal(&self, op: &mut dyn Operation) -> Result<Value> {
        self.run_as(op, Caller::Internal).await
    }

    async fn run_as(&self, op: &mut dyn Operation, caller: Caller<'_>) -> Result<Value> {
        let mut ctx = OpContext::new(op.name(), self.clock().now());
        let span = info_span!("operation", name = %ctx.name, op_id = %ctx.op_id);
        let result = self.drive(op, &mut ctx, caller).instrument(span).await;
        if let Err(err) = &result {
            log_failure(&ctx.name, err);
        }
        result
    }

    async fn drive(
        &self,
        op: &mut dyn Operation,
        ctx: &mut OpContext,
        caller: Caller<'_>,
    ) -> Result<Value> {
        if let Some(reply) = op.phase1(ctx).await? {
            return Ok(reply);
        }
        if let Caller::Token(token) = caller {
            ctx.auth = self
                .authenticate(op.access(), op.frozen_policy(), token)
                .await?;
        }

        let outcome = self.transact(op, ctx).await?;
        event!(
            Level::DEBUG,
            rows = outcome.report.written.len(),
            bumped = outcome.changed.len(),
            "operation committed"
        );
        self.post_commit(op, ctx, &outcome).await;
        let reply = op.result()?;

        if ctx.flags().rate_limited {
            let delay_ms = self.config().throttle.delay_ms;
            event!(Level::INFO, delay_ms, "throttling rate-limited account");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(reply)
    }

    async fn authenticate(
        &self,
        access: AccessMode,
        frozen: FrozenPolicy,
        token: Option<&str>,
    ) -> Result<Option<AuthContext>> {
        let Some(token) = token else {
            if access == AccessMode::Public {
                return Ok(None);
            }
            return Err(EngineError::functional(codes::TOKEN_MISSING, "token required"));
        };

        let claims = self.authenticator().decode(token).await?;
        let admin = claims
            .admin_key
            .as_ref()
            .is_some_and(|key| self.config().admin_keys.contains(key));
        if access == AccessMode::Admin && !admin {
            return Err(EngineError::functional(codes::NOT_ADMIN, "system-admin key required"));
        }

        let org = claims
            .org
            .as_deref()
            .ok_or_else(|| EngineError::functional(codes::TOKEN_INVALID, "token names no tenant"))?;
        let source = self.backend().as_source();
        let tenant = self
            .directory()
            .by_org(source, org)
            .await?
            .ok_or_else(|| {
                EngineError::functional(codes::TENANT_UNKNOWN, format!("unknown tenant '{}'", org))
            })?;

        let mut read_only = false;
        if !admin {
            if tenant.closed {
                return Err(EngineError::functional(codes::TENANT_CLOSED, "tenant is closed"));
            }
            if tenant.frozen {
                match frozen {
                    FrozenPolicy::Reject => {
                        return Err(EngineError::functional(codes::TENANT_FROZEN, "tenant is frozen"));
                    }
                    FrozenPolicy::AllowReadOnly => read_only = true,
                }
            }
        }

        let mut flags = AdmissionFlags::default();
        if let Some(account) = claims.account {
            if Id::ns(account) != tenant.ns || !Id::is_account(account) {
                return Err(EngineError::functional(
                    codes::TOKEN_INVALID,
                    "account does not belong to the tenant",
                ));
            }
            let alive = self
                .cache()
                .get_fresh(source, Collection::Versions, account)
                .await?
                .is_some_and(|row| !row.deleted);
            if !alive {
                return Err(EngineError::functional(
                    codes::ACCOUNT_UNKNOWN,
                    format!("account {} does not exist", account),
                ));
            }
            if let Some(row) = self.cache().get_fresh(source, Collection::Usages, account).await? {
                flags = Usage::decode(&row)?.counters.flags(&self.config().quotas);
            }
        }

        match access {
            AccessMode::Authenticated if claims.account.is_none() && !admin => {
                return Err(EngineError::functional(codes::TOKEN_MISSING, "account session required"));
            }
            AccessMode::Privileged
                if !admin && !claims.account.is_some_and(Id::is_accountable) =>
            {
                return Err(EngineError::functional(
                    codes::NOT_PRIVILEGED,
                    "operation reserved to the accountable account",
                ));
            }
            _ => {}
        }

        Ok(Some(AuthContext {
            tenant,
            account: claims.account,
            session: claims.session,
            admin,
            read_only,
            flags,
        }))
    }

    /// phase2 + cascade in one transaction, retried on backend conflicts.
    async fn transact(&self, op: &mut dyn Operation, ctx: &OpContext) -> Result<CommitOutcome> {
        let policy = &self.config().retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let txn = self.backend().begin().await?;
            let mut docs = DocumentManager::new(txn, self.cache().clone(), ctx.today)
                .with_caller(ctx.account())
                .with_read_only(ctx.is_read_only())
                .with_purge_grace(self.config().gc.purge_grace_days);

            let result = match op.phase2(ctx, &mut docs).await {
                Ok(()) => docs.commit().await,
                Err(err) => Err(err),
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_conflict() && attempt < max_attempts => {
                    let backoff_ms = policy.backoff_ms(attempt);
                    warn!(
                        "{} retry on conflict (attempt {} of {}): {} (backoff={}ms)",
                        ctx.name, attempt, max_attempts, err, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Effects that must never undo the committed transaction.
    async fn post_commit(&self, op: &mut dyn Operation, ctx: &OpContext, outcome: &CommitOutcome) {
        if let Err(err) = self.cache().apply_commit(&outcome.report) {
            warn!("cache propagation failed: {}", err);
        }
        if let Err(err) = self.directory().apply_commit(&outcome.report) {
            warn!("tenant directory propagation failed: {}", err);
        }

        self.drain_file_purges(&outcome.file_purges).await;

        for notice in ChangeNotice::group_by_tenant(&outcome.changed) {
            if let Err(err) = self.notifier().notify(notice).await {
                warn!("change notification failed: {}", err);
            }
        }

        let post = PostCommit {
            objects: &**self.objects(),
            outcome,
        };
        if let Err(err) = op.phase3(ctx, post).await {
            event!(Level::ERROR, error = %err, "phase3 failed after commit");
        }
    }

    /// Runs file purges recorded by the commit and removes their intents.
    /// Whatever fails stays queued for the GC file-purge step.
    async fn drain_file_purges(&self, purges: &[FilePurge]) {
        if purges.is_empty() {
            return;
        }
        let mut done = Vec::new();
        for purge in purges {
            match delete_purged_files(&**self.objects(), purge).await {
                Ok(()) => done.push(purge),
                Err(err) => warn!("file purge for {} deferred: {}", purge.owner, err),
            }
        }
        if done.is_empty() {
            return;
        }

        let removed = async {
            let mut txn = self.backend().begin().await?;
            for purge in &done {
                txn.delete(Collection::FilePurges, purge.owner, purge.sub);
            }
            txn.commit().await
        }
        .await;
        if let Err(err) = removed {
            warn!("file purge intents left for GC: {}", err);
        }
    }
}
