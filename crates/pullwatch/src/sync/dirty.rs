//! Dirty-repository detection from event streams.
//!
//! Two independent streams per server (the user's own events and the events
//! they receive) are walked newest-first. Every event strictly newer than the
//! stored cursor marks its repository dirty; the walk stops at the first
//! event that is not newer, since everything past it was processed in an
//! earlier cycle. Conditional requests keyed on the stream's stored ETag
//! make the common no-change case a single 304.
//!
//! Independently of the streams, repositories untouched for longer than the
//! staleness window are force-marked dirty as a net against missed events.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::api::PageFlow;
use crate::http::HttpTransport;
use crate::store::{self, RemoteEvent, StreamKind};

use super::engine::SyncContext;
use super::progress::{emit, SyncEvent};

/// Mark dirty every repository with new events on any server, then apply the
/// staleness net. Failures mark the owning server's sync failed but never
/// block the other servers' scans.
pub(crate) async fn mark_dirty_repos<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let server_ids = { store::lock(&ctx.store).good_server_ids() };

    let mut handles = Vec::with_capacity(server_ids.len() * 2);
    for server_id in server_ids {
        for kind in [StreamKind::UserEvents, StreamKind::ReceivedEvents] {
            let task_ctx = Arc::clone(ctx);
            handles.push(tokio::spawn(async move {
                scan_stream(task_ctx, server_id, kind).await
            }));
        }
    }

    let mut dirty_ids: HashSet<i64> = HashSet::new();
    for handle in handles {
        if let Ok(ids) = handle.await {
            dirty_ids.extend(ids);
        }
    }

    let now = Utc::now();
    let marked = {
        let mut store = store::lock(&ctx.store);
        let marked = store.mark_repos_dirty(&dirty_ids, now);
        let stale = store.mark_stale_repos_dirty(now - ctx.settings.staleness_window, now);
        if stale > 0 {
            tracing::debug!(count = stale, "marked dirty repos that were not refreshed within the staleness window");
        }
        marked
    };
    if marked > 0 {
        tracing::debug!(count = marked, "marked dirty repos with new events in their event stream");
    }
    emit(
        ctx.progress.as_deref(),
        SyncEvent::ReposMarkedDirty { count: marked },
    );
}

/// Walk one event stream, returning the repository ids with new events.
///
/// The stream's ETag is persisted whatever the outcome, and the timestamp
/// cursor ends at the newest observed event. A `None` cursor is the
/// never-synced sentinel: the first event still marks its repo dirty, but
/// the walk stops right after, since a first sync treats everything as
/// dirty anyway and deep event history is useless.
async fn scan_stream<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    server_id: uuid::Uuid,
    kind: StreamKind,
) -> HashSet<i64> {
    let (user_name, start_cursor, stored_etag) = {
        let store = store::lock(&ctx.store);
        let Some(server) = store.server(server_id) else {
            return HashSet::new();
        };
        let cursor = server.cursor(kind);
        (
            server.user_name.clone().unwrap_or_else(|| "unknown".to_string()),
            cursor.latest_event_at,
            cursor.etag.clone(),
        )
    };

    let path = match kind {
        StreamKind::UserEvents => format!("/users/{user_name}/events"),
        StreamKind::ReceivedEvents => format!("/users/{user_name}/received_events"),
    };
    let extra_headers: Vec<(String, String)> = stored_etag
        .map(|etag| vec![("If-None-Match".to_string(), etag)])
        .unwrap_or_default();

    let mut dirty_ids: HashSet<i64> = HashSet::new();
    let mut newest = start_cursor;

    let outcome = ctx
        .api
        .get_paged(&path, server_id, &extra_headers, |items, _last| {
            for value in items {
                let event: RemoteEvent = match serde_json::from_value(value.clone()) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping undecodable event");
                        continue;
                    }
                };
                if Some(event.created_at) > start_cursor {
                    tracing::debug!(at = %event.created_at, "new event");
                    if let Some(repo) = &event.repo {
                        dirty_ids.insert(repo.id);
                    }
                    if Some(event.created_at) > newest {
                        newest = Some(event.created_at);
                    }
                    if start_cursor.is_none() {
                        // First sync: everything is dirty anyway, no need to
                        // read further once the cursor is seeded.
                        return PageFlow::Stop;
                    }
                } else {
                    // The rest of this stream was processed in an earlier
                    // cycle.
                    return PageFlow::Stop;
                }
            }
            PageFlow::Continue
        })
        .await;

    {
        let mut store = store::lock(&ctx.store);
        if let Some(server) = store.server_mut(server_id) {
            let cursor = server.cursor_mut(kind);
            cursor.latest_event_at = newest;
            cursor.etag = match &outcome {
                Ok(paged) => paged.etag.clone(),
                Err(_) => None,
            };
        }
        if outcome.is_err() {
            store.mark_sync_failed(server_id);
        }
    }

    dirty_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{header_get, MockTransport};
    use crate::settings::Settings;
    use crate::store::{RemoteRepo, Server, Store};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    const BASE: &str = "https://api.example.com";

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap()
    }

    fn remote_repo(id: i64, full_name: &str) -> RemoteRepo {
        serde_json::from_value(json!({"id": id, "full_name": full_name})).unwrap()
    }

    fn ctx_with_repos(
        cursor: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> (Arc<SyncContext<MockTransport>>, MockTransport, uuid::Uuid) {
        let mut store = Store::new();
        let mut server = Server::new("work", BASE, Some("secret".to_string()));
        server.user_name = Some("alice".to_string());
        server.user_id = Some(7);
        server.user_events.latest_event_at = cursor;
        server.user_events.etag = etag.map(str::to_string);
        let sid = store.add_server(server);

        let now = Utc::now();
        for (id, name) in [(1, "acme/widget"), (2, "acme/gadget"), (3, "acme/gizmo")] {
            store.upsert_repo(&remote_repo(id, name), sid, now);
            let repo = store.repo_mut(id).unwrap();
            repo.dirty = false;
            repo.last_dirtied = Some(now);
        }

        let transport = MockTransport::new();
        let ctx = SyncContext::builder()
            .transport(transport.clone())
            .store(store::shared(store))
            .settings(Settings::default())
            .build()
            .expect("context builds");
        (Arc::new(ctx), transport, sid)
    }

    fn events_url() -> String {
        format!("{BASE}/users/alice/events?page=1&per_page=100")
    }

    fn received_url() -> String {
        format!("{BASE}/users/alice/received_events?page=1&per_page=100")
    }

    #[tokio::test]
    async fn events_newer_than_cursor_mark_repos_dirty_and_advance_cursor() {
        let (ctx, transport, sid) = ctx_with_repos(Some(ts(10)), Some("W/\"old\""));
        transport.push_json(
            events_url(),
            200,
            &json!([
                {"created_at": "2026-01-12T00:00:00Z", "repo": {"id": 1}},
                {"created_at": "2026-01-11T00:00:00Z", "repo": {"id": 2}},
                {"created_at": "2026-01-09T00:00:00Z", "repo": {"id": 3}},
            ]),
            &[("ETag", "W/\"new\"")],
        );
        transport.push_json(received_url(), 200, &json!([]), &[]);

        mark_dirty_repos(&ctx).await;

        let store = store::lock(&ctx.store);
        assert!(store.repo(1).unwrap().dirty);
        assert!(store.repo(2).unwrap().dirty);
        assert!(!store.repo(3).unwrap().dirty, "older event must not mark");

        let server = store.server(sid).unwrap();
        assert_eq!(server.user_events.latest_event_at, Some(ts(12)));
        assert_eq!(server.user_events.etag.as_deref(), Some("W/\"new\""));
        assert!(server.last_sync_succeeded);
        drop(store);

        // The stored ETag rode along as a conditional header.
        let sent = transport
            .requests()
            .into_iter()
            .find(|r| r.url == events_url())
            .expect("events request issued");
        assert_eq!(header_get(&sent.headers, "if-none-match"), Some("W/\"old\""));
    }

    #[tokio::test]
    async fn sentinel_cursor_stops_after_first_event() {
        let (ctx, transport, sid) = ctx_with_repos(None, None);
        transport.push_json(
            events_url(),
            200,
            &json!([
                {"created_at": "2026-01-12T00:00:00Z", "repo": {"id": 1}},
                {"created_at": "2026-01-11T00:00:00Z", "repo": {"id": 2}},
            ]),
            &[],
        );
        transport.push_json(received_url(), 200, &json!([]), &[]);

        mark_dirty_repos(&ctx).await;

        let store = store::lock(&ctx.store);
        assert!(store.repo(1).unwrap().dirty);
        assert!(
            !store.repo(2).unwrap().dirty,
            "walk must stop right after the first event on first sync"
        );
        assert_eq!(
            store.server(sid).unwrap().user_events.latest_event_at,
            Some(ts(12))
        );
    }

    #[tokio::test]
    async fn not_modified_stream_keeps_cursor_and_server_health() {
        let (ctx, transport, sid) = ctx_with_repos(Some(ts(10)), Some("W/\"old\""));
        transport.push_json(events_url(), 304, &json!({}), &[]);
        transport.push_json(received_url(), 304, &json!({}), &[]);

        mark_dirty_repos(&ctx).await;

        let store = store::lock(&ctx.store);
        let server = store.server(sid).unwrap();
        assert_eq!(server.user_events.latest_event_at, Some(ts(10)));
        assert!(server.last_sync_succeeded);
        assert!(!store.repo(1).unwrap().dirty);
    }

    #[tokio::test]
    async fn failed_stream_marks_server_failed_but_still_completes() {
        let (ctx, transport, sid) = ctx_with_repos(Some(ts(10)), None);
        transport.push_json(events_url(), 500, &json!({}), &[]);
        transport.push_json(received_url(), 200, &json!([]), &[]);

        mark_dirty_repos(&ctx).await;

        let store = store::lock(&ctx.store);
        assert!(!store.server(sid).unwrap().last_sync_succeeded);
    }

    #[tokio::test]
    async fn stale_repos_are_marked_dirty_without_events() {
        let (ctx, transport, _sid) = ctx_with_repos(Some(ts(10)), None);
        {
            let mut store = store::lock(&ctx.store);
            let repo = store.repo_mut(1).unwrap();
            repo.last_dirtied = Some(Utc::now() - chrono::Duration::hours(2));
        }
        transport.push_json(events_url(), 200, &json!([]), &[]);
        transport.push_json(received_url(), 200, &json!([]), &[]);

        mark_dirty_repos(&ctx).await;

        let store = store::lock(&ctx.store);
        assert!(store.repo(1).unwrap().dirty);
        assert!(!store.repo(2).unwrap().dirty);
    }
}
