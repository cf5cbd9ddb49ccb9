//! The HTTP request layer and paginator.
//!
//! Every remote read funnels through [`Api::get`]: it fail-fasts on servers
//! already known broken this cycle, consults the per-URL backoff ledger,
//! paces itself against the optional proactive limiter and the per-host
//! connection budget, and captures rate-limit counters off every response
//! regardless of outcome. [`Api::get_paged`] drives page-by-page fetches of
//! collection endpoints on top of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::backoff::BackoffLedger;
use crate::error::{ApiError, Result};
use crate::http::{header_get, HttpRequest, HttpTransport};
use crate::limiter::ApiRateLimiter;
use crate::store::{self, SharedStore};
use crate::sync::{emit, ProgressCallback, SyncEvent};

/// Items requested per collection page.
pub const PAGE_SIZE: u32 = 100;

/// Concurrent in-flight requests toward the remote host.
///
/// This stands in for the transport-level connections-per-host limit; there
/// is deliberately no additional application-level concurrency cap.
pub const MAX_HOST_CONNECTIONS: usize = 4;

/// A successfully parsed API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body; `Null` when the body was empty.
    pub value: serde_json::Value,
    pub etag: Option<String>,
    /// True when the response's Link metadata carries no "next" relation.
    pub last_page: bool,
}

/// Control flow returned by a per-page callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFlow {
    Continue,
    Stop,
}

/// Outcome of a completed paginated fetch.
#[derive(Debug, Clone, Default)]
pub struct PagedOutcome {
    /// Status of the terminating response; `None` when no request was made
    /// (empty path).
    pub status: Option<u16>,
    /// ETag of the first page, the one conditional requests key on.
    pub etag: Option<String>,
}

/// The request layer.
pub struct Api<T: HttpTransport> {
    transport: T,
    store: SharedStore,
    backoff: Mutex<BackoffLedger>,
    limiter: Option<ApiRateLimiter>,
    permits: Semaphore,
    progress: Option<Arc<ProgressCallback>>,
    cancel: Arc<AtomicBool>,
}

impl<T: HttpTransport> Api<T> {
    pub fn new(transport: T, store: SharedStore) -> Self {
        Self {
            transport,
            store,
            backoff: Mutex::new(BackoffLedger::new()),
            limiter: None,
            permits: Semaphore::new(MAX_HOST_CONNECTIONS),
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a proactive rate limiter consulted before every dispatch.
    #[must_use]
    pub fn with_limiter(mut self, limiter: ApiRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Attach a progress callback for usage signals.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Share a cancellation flag; once raised, further dispatches are
    /// refused with [`ApiError::Cancelled`].
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffLedger> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue an authenticated GET.
    ///
    /// `path` is either absolute (a link handed out by the API) or
    /// server-relative (leading `/`). `ignore_last_sync` bypasses the
    /// fail-fast check for out-of-band calls such as credential tests.
    ///
    /// # Errors
    ///
    /// See [`ApiError`]; note that [`ApiError::NotModified`] and
    /// [`ApiError::Gone`] are success-equivalent for most callers.
    pub async fn get(
        &self,
        path: &str,
        server_id: Uuid,
        ignore_last_sync: bool,
        params: &[(&str, &str)],
        extra_headers: &[(String, String)],
    ) -> Result<ApiResponse> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ApiError::Cancelled);
        }

        let (api_base, auth_token, label, server_ok) = {
            let store = store::lock(&self.store);
            let server = store
                .server(server_id)
                .ok_or_else(|| ApiError::transport(format!("unknown server {server_id}")))?;
            (
                server.api_base.clone(),
                server.auth_token.clone(),
                server.label.clone(),
                server.last_sync_succeeded,
            )
        };

        if !server_ok && !ignore_last_sync {
            tracing::debug!(server = %label, path, "server already failed this cycle, saving the network call");
            return Err(ApiError::Throttled {
                url: path.to_string(),
            });
        }

        let url = expand_url(&api_base, path, params)?;

        if !self.backoff().should_attempt(&url) {
            tracing::debug!(server = %label, %url, "pre-empted fetch to previously broken URL");
            return Err(ApiError::Throttled { url });
        }

        if let Some(limiter) = &self.limiter {
            limiter.wait().await;
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ApiError::Cancelled)?;

        let mut headers: Vec<(String, String)> =
            vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(token) = &auth_token {
            headers.push(("Authorization".to_string(), format!("token {token}")));
        }
        for (k, v) in extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        let response = match self
            .transport
            .get(HttpRequest {
                url: url.clone(),
                headers,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(server = %label, %url, error = %e, "GET failed in transport");
                return Err(ApiError::transport(e.to_string()));
            }
        };

        self.absorb_rate_headers(server_id, &response.headers);

        let status = response.status;
        if status <= 299 {
            self.backoff().record_success(&url);
            tracing::debug!(server = %label, %url, status, "GET ok");

            let value = if response.body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&response.body)?
            };
            let etag = response.header("etag").map(str::to_string);
            let last_page = !link_header_has_next(response.header("link").unwrap_or(""));
            Ok(ApiResponse {
                status,
                value,
                etag,
                last_page,
            })
        } else {
            if status >= 400 {
                self.backoff().record_failure(&url, status);
            }
            match status {
                304 => {
                    tracing::debug!(server = %label, %url, "no change reported (304)");
                    Err(ApiError::NotModified)
                }
                404 | 410 => Err(ApiError::Gone { status }),
                _ => {
                    tracing::debug!(server = %label, %url, status, "GET failed");
                    Err(ApiError::Http { status })
                }
            }
        }
    }

    /// Fetch every page of a collection endpoint.
    ///
    /// Pages are requested sequentially starting at 1, `PAGE_SIZE` items per
    /// page. The loop ends when the response carries no "next" link relation
    /// or the callback returns [`PageFlow::Stop`], whichever comes first. A
    /// 304 on any page ends the fetch successfully; an empty `path` is an
    /// immediate success, since some child-collection links are legitimately
    /// absent.
    pub async fn get_paged<F>(
        &self,
        path: &str,
        server_id: Uuid,
        extra_headers: &[(String, String)],
        mut per_page: F,
    ) -> Result<PagedOutcome>
    where
        F: FnMut(&[serde_json::Value], bool) -> PageFlow + Send,
    {
        if path.is_empty() {
            return Ok(PagedOutcome::default());
        }

        let per_page_size = PAGE_SIZE.to_string();
        let mut first_etag: Option<String> = None;
        let mut page: u32 = 1;

        loop {
            let page_string = page.to_string();
            let params = [
                ("page", page_string.as_str()),
                ("per_page", per_page_size.as_str()),
            ];

            match self
                .get(path, server_id, false, &params, extra_headers)
                .await
            {
                Ok(resp) => {
                    if page == 1 {
                        first_etag = resp.etag.clone();
                    }
                    let status = resp.status;
                    let last_from_headers = resp.last_page;
                    let items: Vec<serde_json::Value> = serde_json::from_value(resp.value)?;

                    let mut is_last = last_from_headers;
                    if per_page(&items, last_from_headers) == PageFlow::Stop {
                        is_last = true;
                    }
                    if is_last {
                        return Ok(PagedOutcome {
                            status: Some(status),
                            etag: first_etag,
                        });
                    }
                    page += 1;
                }
                Err(ApiError::NotModified) => {
                    return Ok(PagedOutcome {
                        status: Some(304),
                        etag: first_etag,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh a server's rate budget counters out of band.
    ///
    /// Bypasses the fail-fast check so a broken server's budget stays
    /// observable. Deployments without a rate-limit endpoint answer 404;
    /// that means "no limits", not failure.
    pub async fn refresh_rate_limit(&self, server_id: Uuid) -> Result<()> {
        match self.get("/rate_limit", server_id, true, &[], &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Check that a server's credentials work at all.
    pub async fn test_server(&self, server_id: Uuid) -> Result<()> {
        self.refresh_rate_limit(server_id).await
    }

    /// Record rate counters from response headers onto the server, and
    /// signal the change. Runs on every response, success or failure; absent
    /// headers leave the last observed values in place.
    fn absorb_rate_headers(&self, server_id: Uuid, headers: &[(String, String)]) {
        let remaining = header_get(headers, "X-RateLimit-Remaining").and_then(|v| v.parse().ok());
        let limit = header_get(headers, "X-RateLimit-Limit").and_then(|v| v.parse().ok());
        let reset_at: Option<DateTime<Utc>> = header_get(headers, "X-RateLimit-Reset")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0));

        if remaining.is_none() && limit.is_none() && reset_at.is_none() {
            return;
        }

        {
            let mut store = store::lock(&self.store);
            if let Some(server) = store.server_mut(server_id) {
                if remaining.is_some() {
                    server.requests_remaining = remaining;
                }
                if limit.is_some() {
                    server.requests_limit = limit;
                }
                if reset_at.is_some() {
                    server.reset_at = reset_at;
                }
            }
        }

        emit(
            self.progress.as_deref(),
            SyncEvent::ApiUsage {
                server: server_id,
                remaining: remaining.unwrap_or(-1),
                limit: limit.unwrap_or(-1),
            },
        );
    }
}

/// Build the absolute request URL for a path plus query parameters.
fn expand_url(api_base: &str, path: &str, params: &[(&str, &str)]) -> Result<String> {
    let absolute = if path.starts_with('/') {
        format!("{}{}", api_base.trim_end_matches('/'), path)
    } else {
        path.to_string()
    };

    let mut url = url::Url::parse(&absolute)
        .map_err(|e| ApiError::transport(format!("invalid request URL {absolute}: {e}")))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

/// Whether a Link header advertises a further page.
///
/// Link headers look like
/// `<https://api.example.com/repos?page=2>; rel="next", <...&page=9>; rel="last"`.
fn link_header_has_next(link_header: &str) -> bool {
    link_header.split(',').any(|part| {
        part.split(';').skip(1).any(|segment| {
            segment
                .trim()
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"') == "next")
                .unwrap_or(false)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockTransport;
    use crate::store::{Server, Store};
    use serde_json::json;

    const BASE: &str = "https://api.example.com";

    fn api_with_server() -> (Api<MockTransport>, MockTransport, Uuid, SharedStore) {
        let mut store = Store::new();
        let sid = store.add_server(Server::new("work", BASE, Some("secret".to_string())));
        let shared = store::shared(store);
        let transport = MockTransport::new();
        let api = Api::new(transport.clone(), Arc::clone(&shared));
        (api, transport, sid, shared)
    }

    #[test]
    fn link_header_next_detection() {
        assert!(link_header_has_next(
            r#"<https://api.example.com/r?page=2>; rel="next", <https://api.example.com/r?page=9>; rel="last""#
        ));
        assert!(!link_header_has_next(
            r#"<https://api.example.com/r?page=9>; rel="last""#
        ));
        assert!(!link_header_has_next(""));
    }

    #[test]
    fn expand_url_joins_base_and_appends_params() {
        let url = expand_url(BASE, "/user", &[]).unwrap();
        assert_eq!(url, "https://api.example.com/user");

        let url = expand_url(BASE, "/repos/a/b/pulls", &[("page", "2"), ("per_page", "100")])
            .unwrap();
        assert_eq!(
            url,
            "https://api.example.com/repos/a/b/pulls?page=2&per_page=100"
        );

        // Absolute links pass through untouched.
        let url = expand_url(BASE, "https://other.example.com/x", &[]).unwrap();
        assert_eq!(url, "https://other.example.com/x");
    }

    #[tokio::test]
    async fn get_parses_body_etag_and_rate_headers() {
        let (api, transport, sid, store) = api_with_server();
        transport.push_json(
            format!("{BASE}/user"),
            200,
            &json!({"login": "alice", "id": 7}),
            &[
                ("ETag", "W/\"abc\""),
                ("X-RateLimit-Remaining", "4999"),
                ("X-RateLimit-Limit", "5000"),
                ("X-RateLimit-Reset", "1768471200"),
            ],
        );

        let resp = api.get("/user", sid, false, &[], &[]).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.value["login"], "alice");
        assert_eq!(resp.etag.as_deref(), Some("W/\"abc\""));
        assert!(resp.last_page);

        let store = store::lock(&store);
        let server = store.server(sid).unwrap();
        assert_eq!(server.requests_remaining, Some(4999));
        assert_eq!(server.requests_limit, Some(5000));
        assert_eq!(server.reset_at.unwrap().timestamp(), 1768471200);
    }

    #[tokio::test]
    async fn get_sends_auth_and_extra_headers() {
        let (api, transport, sid, _store) = api_with_server();
        transport.push_json(format!("{BASE}/user"), 200, &json!({}), &[]);

        let extra = vec![("If-None-Match".to_string(), "W/\"tag\"".to_string())];
        api.get("/user", sid, false, &[], &extra).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let headers = &requests[0].headers;
        assert_eq!(header_get(headers, "authorization"), Some("token secret"));
        assert_eq!(header_get(headers, "if-none-match"), Some("W/\"tag\""));
        assert_eq!(header_get(headers, "accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn rate_counters_update_even_on_failure_responses() {
        let (api, transport, sid, store) = api_with_server();
        transport.push_json(
            format!("{BASE}/user"),
            500,
            &json!({"message": "boom"}),
            &[("X-RateLimit-Remaining", "12"), ("X-RateLimit-Limit", "60")],
        );

        let err = api.get("/user", sid, false, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Http { status: 500 }));

        let store = store::lock(&store);
        let server = store.server(sid).unwrap();
        assert_eq!(server.requests_remaining, Some(12));
        assert_eq!(server.requests_limit, Some(60));
    }

    #[tokio::test]
    async fn failed_server_is_not_called_unless_ignored() {
        let (api, transport, sid, store) = api_with_server();
        store::lock(&store).mark_sync_failed(sid);
        transport.push_json(format!("{BASE}/user"), 200, &json!({}), &[]);

        let err = api.get("/user", sid, false, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Throttled { .. }));
        assert_eq!(transport.requests().len(), 0);

        // ignore_last_sync bypasses the fail-fast.
        api.get("/user", sid, true, &[], &[]).await.unwrap();
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_preempts_repeat_calls_to_a_broken_url() {
        let (api, transport, sid, _store) = api_with_server();
        let url = format!("{BASE}/user");
        transport.push_json(&url, 500, &json!({}), &[]);

        let err = api.get("/user", sid, false, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Http { status: 500 }));
        assert_eq!(transport.hits(&url), 1);

        // The second call is pre-empted without touching the network.
        let err = api.get("/user", sid, false, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Throttled { .. }));
        assert_eq!(transport.hits(&url), 1);

        // After the backoff window the URL is attempted again, and success
        // clears the ledger entry.
        tokio::time::advance(crate::backoff::BACKOFF_STEP).await;
        transport.set_json(&url, 200, &json!({}), &[]);
        api.get("/user", sid, false, &[], &[]).await.unwrap();
        assert!(api.backoff().is_empty());
    }

    #[tokio::test]
    async fn status_mapping_for_not_modified_and_gone() {
        let (api, transport, sid, _store) = api_with_server();

        transport.push_json(format!("{BASE}/a"), 304, &json!({}), &[]);
        assert!(api
            .get("/a", sid, false, &[], &[])
            .await
            .unwrap_err()
            .is_not_modified());

        transport.push_json(format!("{BASE}/b"), 404, &json!({}), &[]);
        assert!(api
            .get("/b", sid, false, &[], &[])
            .await
            .unwrap_err()
            .is_gone());

        transport.push_json(format!("{BASE}/c"), 410, &json!({}), &[]);
        let err = api.get("/c", sid, false, &[], &[]).await.unwrap_err();
        assert_eq!(err.status(), Some(410));
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let (api, transport, sid, _store) = api_with_server();
        transport.push_response(
            format!("{BASE}/user"),
            crate::http::HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: b"not json".to_vec(),
            },
        );

        let err = api.get("/user", sid, false, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn cancelled_flag_refuses_dispatch() {
        let (api, transport, sid, _store) = api_with_server();
        api.cancel_flag().store(true, Ordering::Relaxed);

        let err = api.get("/user", sid, false, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Cancelled));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn paged_fetch_aggregates_pages_in_order_until_link_runs_out() {
        let (api, transport, sid, _store) = api_with_server();
        let page1 = format!("{BASE}/repos/a/b/pulls?page=1&per_page=100");
        let page2 = format!("{BASE}/repos/a/b/pulls?page=2&per_page=100");
        transport.push_json(
            &page1,
            200,
            &json!([{"id": 1}, {"id": 2}]),
            &[
                ("ETag", "W/\"p1\""),
                ("Link", "<https://api.example.com/repos/a/b/pulls?page=2&per_page=100>; rel=\"next\""),
            ],
        );
        transport.push_json(&page2, 200, &json!([{"id": 3}]), &[("ETag", "W/\"p2\"")]);

        let mut seen: Vec<i64> = Vec::new();
        let outcome = api
            .get_paged("/repos/a/b/pulls", sid, &[], |items, _last| {
                seen.extend(items.iter().map(|v| v["id"].as_i64().unwrap()));
                PageFlow::Continue
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(outcome.status, Some(200));
        // The outcome carries the first page's tag, the one conditional
        // requests key on.
        assert_eq!(outcome.etag.as_deref(), Some("W/\"p1\""));
    }

    #[tokio::test]
    async fn paged_fetch_honors_callback_early_stop() {
        let (api, transport, sid, _store) = api_with_server();
        let page1 = format!("{BASE}/repos/a/b/pulls?page=1&per_page=100");
        transport.push_json(
            &page1,
            200,
            &json!([{"id": 1}]),
            &[(
                "Link",
                "<https://api.example.com/repos/a/b/pulls?page=2&per_page=100>; rel=\"next\"",
            )],
        );

        let outcome = api
            .get_paged("/repos/a/b/pulls", sid, &[], |_items, last| {
                assert!(!last, "header says more pages exist");
                PageFlow::Stop
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, Some(200));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn paged_fetch_treats_304_as_success_and_other_errors_as_failure() {
        let (api, transport, sid, _store) = api_with_server();
        let url = format!("{BASE}/repos/a/b/pulls?page=1&per_page=100");

        transport.push_json(&url, 304, &json!({}), &[]);
        let outcome = api
            .get_paged("/repos/a/b/pulls", sid, &[], |_, _| PageFlow::Continue)
            .await
            .unwrap();
        assert_eq!(outcome.status, Some(304));

        transport.set_json(&url, 502, &json!({}), &[]);
        let err = api
            .get_paged("/repos/a/b/pulls", sid, &[], |_, _| PageFlow::Continue)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(502));
    }

    #[tokio::test]
    async fn paged_fetch_with_empty_path_is_an_immediate_success() {
        let (api, transport, sid, _store) = api_with_server();
        let mut called = false;
        let outcome = api
            .get_paged("", sid, &[], |_, _| {
                called = true;
                PageFlow::Continue
            })
            .await
            .unwrap();

        assert!(!called);
        assert_eq!(outcome.status, None);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_refresh_tolerates_missing_endpoint() {
        let (api, transport, sid, _store) = api_with_server();
        let url = format!("{BASE}/rate_limit");
        transport.push_json(&url, 404, &json!({"message": "Not Found"}), &[]);
        api.refresh_rate_limit(sid).await.unwrap();

        transport.set_json(&url, 500, &json!({}), &[]);
        assert!(api.refresh_rate_limit(sid).await.is_err());
    }
}
