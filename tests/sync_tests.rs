mod common;

use common::*;
use tenantdoc::core::{Result, codes};
use tenantdoc::document::{Account, Note};
use tenantdoc::storage::Collection;
use tenantdoc::sync::{Perimeter, SyncReply, SyncRequest};

async fn try_sync(h: &Harness, account: i64, request: SyncRequest) -> Result<SyncReply> {
    let args = serde_json::to_value(&request).unwrap();
    let token = token(account);
    let reply = h.engine.execute("Sync", args, Some(&token)).await?;
    Ok(serde_json::from_value(reply).unwrap())
}

async fn sync(h: &Harness, account: i64, perimeter: Option<&[u8]>, hints: &[i64]) -> SyncReply {
    let request = SyncRequest {
        perimeter: perimeter.map(|p| p.to_vec()),
        full: false,
        hints: hints.to_vec(),
    };
    try_sync(h, account, request).await.unwrap()
}

fn keys(reply: &SyncReply) -> Vec<(Collection, i64, i64)> {
    reply
        .rows
        .iter()
        .map(|row| (row.collection, row.id, row.sub))
        .collect()
}

async fn add_note(h: &Harness, owner: i64, sub: i64) {
    h.internal(Script::new("note.add", move |docs| {
        Box::pin(async move {
            docs.create(Note {
                id: owner,
                sub,
                files: Vec::new(),
                volume: 0,
                data: Vec::new(),
            })
            .await?;
            Ok(())
        })
    }))
    .await
    .unwrap();
}

#[tokio::test]
async fn first_round_sends_everything_then_nothing() {
    let h = harness().await;
    let id = account(1);
    add_note(&h, id, 1).await;

    let first = sync(&h, id, None, &[]).await;
    assert_eq!(
        keys(&first),
        vec![
            (Collection::Accounts, id, 0),
            (Collection::Usages, id, 0),
            (Collection::Avatars, id, 0),
            (Collection::Notes, id, 1),
        ]
    );
    assert!(first.gone.is_empty());
    assert!(!first.more);

    let perimeter = Perimeter::decode(&first.perimeter, id).unwrap();
    let entry = perimeter.entries[&id];
    assert_eq!((entry.seen, entry.baseline), (2, 2));

    let second = sync(&h, id, Some(&first.perimeter), &[]).await;
    assert!(second.rows.is_empty());
}

#[tokio::test]
async fn hinted_round_sends_only_newer_rows() {
    let h = harness().await;
    let id = account(1);
    let first = sync(&h, id, None, &[]).await;

    add_note(&h, id, 7).await;
    // without a hint the client is not told
    let quiet = sync(&h, id, Some(&first.perimeter), &[]).await;
    assert!(quiet.rows.is_empty());

    let hinted = sync(&h, id, Some(&quiet.perimeter), &[id]).await;
    assert_eq!(keys(&hinted), vec![(Collection::Notes, id, 7)]);
    assert_eq!(hinted.rows[0].v, h.version(id).await.unwrap().v);

    // a full resync finds nothing left to send
    let request = SyncRequest {
        perimeter: Some(hinted.perimeter.clone()),
        full: true,
        hints: Vec::new(),
    };
    assert!(try_sync(&h, id, request).await.unwrap().rows.is_empty());
}

#[tokio::test]
async fn deletions_reach_clients_that_had_the_row() {
    let h = harness().await;
    let id = account(1);
    add_note(&h, id, 3).await;
    let first = sync(&h, id, None, &[]).await;

    h.internal(Script::new("note.delete", move |docs| {
        Box::pin(async move {
            docs.delete_sub::<Note>(id, 3).await?;
            Ok(())
        })
    }))
    .await
    .unwrap();

    let next = sync(&h, id, Some(&first.perimeter), &[id]).await;
    assert_eq!(keys(&next), vec![(Collection::Notes, id, 3)]);
    assert!(next.rows[0].deleted);

    // a new client never sees the marker
    let fresh = sync(&h, id, None, &[]).await;
    assert!(!keys(&fresh).contains(&(Collection::Notes, id, 3)));
}

#[tokio::test]
async fn group_sub_collections_follow_access() {
    let h = harness().await;
    let id = account(1);
    let g = group(1);
    h.add_group(g, id, &[id]).await;
    add_note(&h, g, 1).await;

    let first = sync(&h, id, None, &[]).await;
    let got = keys(&first);
    assert!(got.contains(&(Collection::Groups, g, 0)));
    assert!(got.contains(&(Collection::Members, g, 1)));
    assert!(got.contains(&(Collection::Notes, g, 1)));

    // losing notes access keeps the group and its members only
    h.internal(Script::new("access.revoke", move |docs| {
        Box::pin(async move {
            if let Some(access) = docs.require_mut::<Account>(id).await?.groups.get_mut(&g) {
                access.notes = false;
            }
            Ok(())
        })
    }))
    .await
    .unwrap();
    let fresh = sync(&h, id, None, &[]).await;
    let got = keys(&fresh);
    assert!(got.contains(&(Collection::Members, g, 1)));
    assert!(!got.contains(&(Collection::Notes, g, 1)));

    // regaining it sends the whole collection again
    h.internal(Script::new("access.grant", move |docs| {
        Box::pin(async move {
            if let Some(access) = docs.require_mut::<Account>(id).await?.groups.get_mut(&g) {
                access.notes = true;
            }
            Ok(())
        })
    }))
    .await
    .unwrap();
    let regained = sync(&h, id, Some(&fresh.perimeter), &[id]).await;
    assert!(keys(&regained).contains(&(Collection::Notes, g, 1)));
}

#[tokio::test]
async fn lost_and_tombstoned_entities_are_gone() {
    let h = harness().await;
    let id = account(1);
    let (g1, g2) = (group(1), group(2));
    h.add_group(g1, id, &[id]).await;
    h.add_group(g2, id, &[id]).await;
    let first = sync(&h, id, None, &[]).await;

    h.internal(Script::new("groups.change", move |docs| {
        Box::pin(async move {
            docs.require_mut::<Account>(id).await?.groups.remove(&g1);
            docs.tombstone(g2).await?;
            Ok(())
        })
    }))
    .await
    .unwrap();

    let next = sync(&h, id, Some(&first.perimeter), &[id, g2]).await;
    assert_eq!(next.gone, vec![g1, g2]);
    let perimeter = Perimeter::decode(&next.perimeter, id).unwrap();
    assert_eq!(perimeter.entries.keys().copied().collect::<Vec<_>>(), vec![id]);
}

#[tokio::test]
async fn budget_splits_large_perimeters() {
    let mut cfg = config();
    cfg.sync.budget = 1;
    let h = harness_with(cfg).await;
    let id = account(1);
    h.add_group(group(1), id, &[id]).await;

    let first = sync(&h, id, None, &[]).await;
    assert!(first.more);
    assert!(keys(&first).iter().all(|(_, owner, _)| *owner == id));

    let second = sync(&h, id, Some(&first.perimeter), &[]).await;
    assert!(!second.more);
    assert!(keys(&second).contains(&(Collection::Groups, group(1), 0)));
}

#[tokio::test]
async fn foreign_perimeters_are_rejected() {
    let h = harness().await;
    let mine = sync(&h, accountable(), None, &[]).await;
    let request = SyncRequest {
        perimeter: Some(mine.perimeter),
        full: false,
        hints: Vec::new(),
    };
    let err = try_sync(&h, account(1), request).await.unwrap_err();
    assert_eq!(err.code(), codes::BAD_PERIMETER);
}
