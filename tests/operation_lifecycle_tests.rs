mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tenantdoc::core::{EngineError, codes};
use tenantdoc::document::{Account, Note, Tenant, Usage};
use tenantdoc::operation::{
    AccessMode, FrozenPolicy, JsonTokenAuthenticator, Operation, SessionClaims, parse_args,
};

async fn set_tenant(h: &Harness, closed: bool, frozen: bool) {
    h.internal(Script::new("tenant.flags", move |docs| {
        Box::pin(async move {
            let tenant = docs.require_mut::<Tenant>(NS).await?;
            tenant.closed = closed;
            tenant.frozen = frozen;
            Ok(())
        })
    }))
    .await
    .unwrap();
}

fn noop(name: &str) -> Script {
    Script::new(name, |_docs| Box::pin(async move { Ok(()) }))
}

#[tokio::test]
async fn authentication_failures_are_functional() {
    let h = harness().await;

    let err = h.engine.run(&mut noop("x"), None).await.unwrap_err();
    assert_eq!(err.code(), codes::TOKEN_MISSING);

    let err = h.engine.run(&mut noop("x"), Some("not json")).await.unwrap_err();
    assert_eq!(err.code(), codes::TOKEN_INVALID);

    let stranger = JsonTokenAuthenticator::token(&SessionClaims {
        org: Some("nobody".into()),
        account: Some(account(1)),
        ..SessionClaims::default()
    })
    .unwrap();
    let err = h.engine.run(&mut noop("x"), Some(&stranger)).await.unwrap_err();
    assert_eq!(err.code(), codes::TENANT_UNKNOWN);

    let err = h.as_account(account(9), noop("x")).await.unwrap_err();
    assert_eq!(err.code(), codes::ACCOUNT_UNKNOWN);

    // public operations accept anonymous callers
    h.engine
        .run(&mut noop("x").access(AccessMode::Public), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn privileged_and_admin_operations() {
    let h = harness().await;

    let err = h
        .as_account(account(1), noop("p").access(AccessMode::Privileged))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::NOT_PRIVILEGED);
    h.as_account(accountable(), noop("p").access(AccessMode::Privileged))
        .await
        .unwrap();

    let err = h
        .as_account(accountable(), noop("a").access(AccessMode::Admin))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::NOT_ADMIN);
    let admin = admin_token();
    h.engine
        .run(&mut noop("a").access(AccessMode::Admin), Some(&admin))
        .await
        .unwrap();
}

#[tokio::test]
async fn closed_and_frozen_tenants() {
    let h = harness().await;
    let id = account(1);

    set_tenant(&h, false, true).await;
    let err = h.as_account(id, noop("w")).await.unwrap_err();
    assert_eq!(err.code(), codes::TENANT_FROZEN);

    // read-only operations still run, but cannot write
    let read = Script::new("r", move |docs| {
        Box::pin(async move {
            assert!(docs.is_read_only());
            assert!(docs.get::<Account>(id).await?.is_some());
            Ok(())
        })
    })
    .frozen(FrozenPolicy::AllowReadOnly);
    h.as_account(id, read).await.unwrap();

    let write = Script::new("w", move |docs| {
        Box::pin(async move {
            docs.require_mut::<Account>(id).await?;
            Ok(())
        })
    })
    .frozen(FrozenPolicy::AllowReadOnly);
    let err = h.as_account(id, write).await.unwrap_err();
    assert_eq!(err.code(), codes::READ_ONLY);

    set_tenant(&h, true, false).await;
    let err = h.as_account(id, noop("w")).await.unwrap_err();
    assert_eq!(err.code(), codes::TENANT_CLOSED);

    // admins are not locked out
    let admin = admin_token();
    h.engine.run(&mut noop("w"), Some(&admin)).await.unwrap();
}

#[tokio::test]
async fn conflicting_commit_is_retried() {
    let h = harness().await;
    let id = account(1);
    let attempts = Arc::new(AtomicU32::new(0));
    let engine = h.engine.clone();
    let counter = attempts.clone();

    let script = Script::new("contended", move |docs| {
        let engine = engine.clone();
        let counter = counter.clone();
        Box::pin(async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            docs.require::<Account>(id).await?;
            if attempt == 0 {
                // a concurrent writer commits between our read and our commit
                let mut rival = Script::new("rival", move |docs| {
                    Box::pin(async move {
                        docs.require_mut::<Account>(id).await?.data = b"rival".to_vec();
                        Ok(())
                    })
                });
                engine.run_internal(&mut rival).await?;
            }
            docs.require_mut::<Account>(id).await?.data.push(b'!');
            Ok(())
        })
    });
    h.internal(script).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let stored: Account = h.doc(id, 0).await.unwrap();
    assert_eq!(stored.data, b"rival!".to_vec());
    assert_eq!(h.version(id).await.unwrap().v, 3);
}

#[tokio::test]
async fn committed_versions_are_notified_per_tenant() {
    let h = harness().await;
    let mut rx = h.notifier.subscribe();
    let id = account(1);

    h.as_account(
        id,
        Script::new("note.add", move |docs| {
            Box::pin(async move {
                docs.create(Note {
                    id,
                    sub: 1,
                    files: Vec::new(),
                    volume: 0,
                    data: Vec::new(),
                })
                .await?;
                Ok(())
            })
        }),
    )
    .await
    .unwrap();

    let notice = rx.recv().await.unwrap();
    assert_eq!(notice.ns, NS);
    assert_eq!(notice.versions, vec![(id, 2)]);
}

struct Rename {
    account: i64,
    data: String,
}

#[derive(serde::Deserialize)]
struct RenameArgs {
    data: String,
}

#[async_trait::async_trait]
impl Operation for Rename {
    fn name(&self) -> &str {
        "Rename"
    }

    async fn phase2(
        &mut self,
        ctx: &tenantdoc::operation::OpContext,
        docs: &mut tenantdoc::document::DocumentManager,
    ) -> tenantdoc::Result<()> {
        self.account = ctx.require_account()?;
        docs.require_mut::<Account>(self.account).await?.data = self.data.clone().into_bytes();
        Ok(())
    }

    fn result(&mut self) -> tenantdoc::Result<serde_json::Value> {
        Ok(json!({ "account": self.account }))
    }
}

#[tokio::test]
async fn registered_operations_run_by_name() {
    let h = harness().await;
    h.engine
        .register("Rename", |args| {
            let args: RenameArgs = parse_args("Rename", args)?;
            Ok(Box::new(Rename {
                account: 0,
                data: args.data,
            }) as Box<dyn Operation>)
        })
        .unwrap();
    assert!(h.engine.operation_names().unwrap().contains(&"Sync".to_string()));

    let token = token(account(1));
    let reply = h
        .engine
        .execute("Rename", json!({ "data": "zed" }), Some(&token))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "account": account(1) }));
    let stored: Account = h.doc(account(1), 0).await.unwrap();
    assert_eq!(stored.data, b"zed".to_vec());

    let err = h
        .engine
        .execute("Rename", json!({ "nope": 1 }), Some(&token))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::BAD_ARGUMENTS);

    let err = h
        .engine
        .execute("Missing", json!({}), Some(&token))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::UNKNOWN_OPERATION);
}

#[tokio::test]
async fn injected_commit_failure_is_not_retried() {
    let h = harness().await;
    let id = account(1);
    h.backend.fail_next_commits(1).await;

    let err = h
        .internal(Script::new("touch", move |docs| {
            Box::pin(async move {
                docs.require_mut::<Account>(id).await?;
                Ok(())
            })
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unexpected { .. }));
    assert_eq!(h.version(id).await.unwrap().v, 1);
}

#[tokio::test]
async fn rate_limited_accounts_are_throttled() {
    let mut cfg = config();
    cfg.throttle.delay_ms = 300;
    let h = harness_with(cfg).await;
    let id = account(1);
    h.internal(Script::new("usage.burn", move |docs| {
        Box::pin(async move {
            let usage = docs.require_mut::<Usage>(id).await?;
            usage.counters.cons_month = usage.counters.qc_raw() + 1;
            Ok(())
        })
    }))
    .await
    .unwrap();

    let started = Instant::now();
    h.as_account(accountable(), noop("calm")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));

    let started = Instant::now();
    h.as_account(id, noop("busy")).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
}
