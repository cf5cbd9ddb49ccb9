//! Integration tests for multi-cycle store behavior.
//!
//! These exercise the transactional store and the refresh throttle across
//! several simulated sync cycles through the public API, the way the engine
//! drives them: snapshot, mutate, reconcile per server, commit.

use chrono::{Duration, TimeZone, Utc};
use pullwatch::store::{RemoteComment, RemoteItem, RemoteRepo};
use pullwatch::{ChildKind, Condition, Disposition, ItemKind, RefreshThrottle, Server, Store};

fn remote_repo(id: i64, full_name: &str) -> RemoteRepo {
    serde_json::from_value(serde_json::json!({"id": id, "full_name": full_name})).unwrap()
}

fn remote_item(id: i64, number: i64, state: &str, updated_at: &str) -> RemoteItem {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "number": number,
        "title": format!("item {number}"),
        "state": state,
        "updated_at": updated_at,
    }))
    .unwrap()
}

fn remote_comment(id: i64, created_at: &str) -> RemoteComment {
    serde_json::from_value(serde_json::json!({"id": id, "created_at": created_at})).unwrap()
}

#[test]
fn three_cycle_lifecycle_of_an_item() {
    let mut store = Store::new();
    let sid = store.add_server(Server::new(
        "work",
        "https://api.example.com",
        Some("token".to_string()),
    ));
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

    // Cycle 1: discovery finds a repo and an open pull.
    store.begin_cycle();
    store.reset_sync_success();
    store.upsert_repo(&remote_repo(1, "acme/widget"), sid, now);
    store.upsert_item(
        &remote_item(10, 5, "open", "2026-02-20T00:00:00Z"),
        ItemKind::Pull,
        1,
        sid,
    );
    store.upsert_comment(&remote_comment(100, "2026-02-20T01:00:00Z"), 10, sid);
    store.commit();
    assert_eq!(store.item(10).unwrap().disposition, Disposition::DoNothing);

    // Cycle 2: the item is still listed, nothing changed.
    store.begin_cycle();
    store.reset_sync_success();
    store.mark_open_items_delete(1);
    store.upsert_item(
        &remote_item(10, 5, "open", "2026-02-20T00:00:00Z"),
        ItemKind::Pull,
        1,
        sid,
    );
    store.commit();
    assert!(store.item(10).is_some());

    // Cycle 3: the item vanished from the listing and stays deleted.
    store.begin_cycle();
    store.reset_sync_success();
    store.mark_open_items_delete(1);
    store.commit();
    assert!(store.item(10).is_none());
    assert!(store.comments_of_item(10).is_empty(), "children cascade");
    assert!(store.repo(1).is_some());
}

#[test]
fn failed_server_cycle_is_invisible_afterwards() {
    let mut store = Store::new();
    let sid_a = store.add_server(Server::new(
        "a",
        "https://a.example.com",
        Some("ta".to_string()),
    ));
    let sid_b = store.add_server(Server::new(
        "b",
        "https://b.example.com",
        Some("tb".to_string()),
    ));
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

    // A clean first cycle seeds both servers.
    store.begin_cycle();
    store.upsert_repo(&remote_repo(1, "a/one"), sid_a, now);
    store.upsert_repo(&remote_repo(2, "b/two"), sid_b, now);
    store.commit();

    // Second cycle: server A observes changes but then fails; B succeeds.
    store.begin_cycle();
    store.reset_sync_success();
    store.upsert_item(
        &remote_item(10, 1, "open", "2026-02-25T00:00:00Z"),
        ItemKind::Issue,
        1,
        sid_a,
    );
    store.repo_mut(1).unwrap().disposition = Disposition::Delete;
    store.mark_sync_failed(sid_a);
    store.upsert_item(
        &remote_item(20, 1, "open", "2026-02-25T00:00:00Z"),
        ItemKind::Issue,
        2,
        sid_b,
    );

    let failed: Vec<_> = store
        .servers()
        .filter(|s| !s.last_sync_succeeded)
        .map(|s| s.id)
        .collect();
    assert_eq!(failed, vec![sid_a]);
    for sid in failed {
        store.rollback_server(sid);
        store.mark_sync_failed(sid);
    }
    store.commit();

    // Server A's half-applied cycle left no trace, not even the deletion.
    assert!(store.repo(1).is_some());
    assert!(store.item(10).is_none());
    assert!(!store.server(sid_a).unwrap().last_sync_succeeded);
    // Server B's cycle stuck.
    assert!(store.item(20).is_some());
    assert!(store.server(sid_b).unwrap().last_sync_succeeded);
}

#[test]
fn throttle_across_simulated_cycles() {
    let interval = 3;
    let mut throttle = RefreshThrottle::new();

    // First sight: eligible, then refreshed.
    assert!(throttle.check(10, ChildKind::Statuses, interval));
    throttle.mark_refreshed(10, ChildKind::Statuses);

    // The next cycles skip until the counter reaches the interval.
    let mut eligible_cycle = None;
    for cycle in 1..=5 {
        if throttle.check(10, ChildKind::Statuses, interval) {
            eligible_cycle = Some(cycle);
            break;
        }
    }
    assert_eq!(eligible_cycle, Some(3));

    // Disabling the feature evicts the counters entirely; the item is
    // re-checked immediately when re-enabled.
    throttle.mark_refreshed(10, ChildKind::Statuses);
    throttle.clear(ChildKind::Statuses);
    assert!(throttle.check(10, ChildKind::Statuses, interval));
}

#[test]
fn condition_survives_reclassification_across_commit() {
    let mut store = Store::new();
    let sid = store.add_server(Server::new(
        "work",
        "https://api.example.com",
        Some("token".to_string()),
    ));
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

    store.begin_cycle();
    store.upsert_repo(&remote_repo(1, "acme/widget"), sid, now);
    store.upsert_item(
        &remote_item(10, 5, "open", "2026-02-20T00:00:00Z"),
        ItemKind::Pull,
        1,
        sid,
    );
    store.commit();

    // A later cycle reclassifies the vanished pull as merged and keeps it.
    store.begin_cycle();
    store.mark_open_items_delete(1);
    {
        let item = store.item_mut(10).unwrap();
        item.disposition = Disposition::DoNothing;
        item.condition = Condition::Merged;
    }
    store.commit();

    let item = store.item(10).unwrap();
    assert_eq!(item.condition, Condition::Merged);
    assert_eq!(item.disposition, Disposition::DoNothing);

    // Merged items are no longer open, so a further cycle's delete pass
    // leaves them alone.
    store.begin_cycle();
    store.mark_open_items_delete(1);
    store.commit();
    assert!(store.item(10).is_some());
}

#[test]
fn staleness_is_relative_to_last_dirtied() {
    let mut store = Store::new();
    let sid = store.add_server(Server::new(
        "work",
        "https://api.example.com",
        Some("token".to_string()),
    ));
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

    store.upsert_repo(&remote_repo(1, "acme/widget"), sid, t0);
    {
        let repo = store.repo_mut(1).unwrap();
        repo.dirty = false;
    }

    // Within the window: untouched.
    let marked = store.mark_stale_repos_dirty(t0 - Duration::hours(1), t0 + Duration::minutes(30));
    assert_eq!(marked, 0);

    // Past the window: netted.
    let later = t0 + Duration::hours(2);
    store.repo_mut(1).unwrap().dirty = false;
    let marked = store.mark_stale_repos_dirty(later - Duration::hours(1), later);
    assert_eq!(marked, 1);
    assert_eq!(store.repo(1).unwrap().last_dirtied, Some(later));
}
