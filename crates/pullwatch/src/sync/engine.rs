//! The sync orchestrator.
//!
//! One call to [`sync_all`] runs a full cycle: optional repository
//! discovery, dirty detection from event streams, item listings for every
//! dirty repository, the concurrent child phases (comments, labels,
//! statuses, closure checks, assignment checks), and finally the per-server
//! commit/rollback reconciliation.
//!
//! Fan-out is plain `tokio::spawn` bounded by the request layer's per-host
//! connection budget; a phase is complete when all of its join handles have
//! been awaited. Failures never cross servers: they set the owning server's
//! sync-failed flag, and everything that server touched this cycle is
//! discarded at commit time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::{Api, PageFlow};
use crate::error::ApiError;
use crate::http::HttpTransport;
use crate::limiter::ApiRateLimiter;
use crate::settings::{HandlingPolicy, Settings};
use crate::store::{
    self, Condition, Disposition, ItemKind, RemoteComment, RemoteItem, RemoteLabel, RemoteRepo,
    RemoteStatus, RemoteUser, Section, SharedStore,
};

use super::progress::{emit, ProgressCallback, RefreshStatus, SyncEvent};
use super::throttle::{ChildKind, RefreshThrottle};

/// Error type for sync context construction.
#[derive(Debug, thiserror::Error)]
pub enum SyncContextError {
    /// Missing required field in builder.
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

#[derive(Debug, Default)]
struct EngineState {
    last_repo_check: Option<DateTime<Utc>>,
    last_successful_refresh: Option<DateTime<Utc>>,
}

/// Builder for a [`SyncContext`].
pub struct SyncContextBuilder<T: HttpTransport> {
    transport: Option<T>,
    store: Option<SharedStore>,
    settings: Settings,
    limiter: Option<ApiRateLimiter>,
    progress: Option<Arc<ProgressCallback>>,
}

impl<T: HttpTransport> Default for SyncContextBuilder<T> {
    fn default() -> Self {
        Self {
            transport: None,
            store: None,
            settings: Settings::default(),
            limiter: None,
            progress: None,
        }
    }
}

impl<T: HttpTransport> SyncContextBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP transport (required).
    pub fn transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the shared object store (required).
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set engine settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach a proactive rate limiter.
    pub fn limiter(mut self, limiter: ApiRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Attach a progress callback.
    pub fn progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Build the sync context.
    ///
    /// # Errors
    ///
    /// Returns [`SyncContextError::MissingField`] if transport or store are
    /// not set.
    pub fn build(self) -> Result<SyncContext<T>, SyncContextError> {
        let transport = self.transport.ok_or(SyncContextError::MissingField {
            field: "transport",
        })?;
        let store = self
            .store
            .ok_or(SyncContextError::MissingField { field: "store" })?;

        let cancel = Arc::new(AtomicBool::new(false));
        let mut api =
            Api::new(transport, Arc::clone(&store)).with_cancel_flag(Arc::clone(&cancel));
        if let Some(limiter) = self.limiter {
            api = api.with_limiter(limiter);
        }
        if let Some(progress) = &self.progress {
            api = api.with_progress(Arc::clone(progress));
        }

        Ok(SyncContext {
            api,
            store,
            settings: self.settings,
            throttle: Mutex::new(RefreshThrottle::new()),
            progress: self.progress,
            state: Mutex::new(EngineState::default()),
            refreshing: AtomicBool::new(false),
            cancel,
        })
    }
}

/// Everything one sync cycle needs, owned in one place.
///
/// All mutable state that concurrent completions touch (the store, the
/// throttle counters, the backoff ledger inside the [`Api`]) lives behind
/// mutexes here rather than as free-floating globals.
pub struct SyncContext<T: HttpTransport> {
    pub(crate) api: Api<T>,
    pub(crate) store: SharedStore,
    pub(crate) settings: Settings,
    pub(crate) throttle: Mutex<RefreshThrottle>,
    pub(crate) progress: Option<Arc<ProgressCallback>>,
    state: Mutex<EngineState>,
    refreshing: AtomicBool,
    cancel: Arc<AtomicBool>,
}

impl<T: HttpTransport> std::fmt::Debug for SyncContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext").finish_non_exhaustive()
    }
}

impl<T: HttpTransport> SyncContext<T> {
    /// Create a new builder.
    pub fn builder() -> SyncContextBuilder<T> {
        SyncContextBuilder::new()
    }

    /// Access the request layer.
    pub fn api(&self) -> &Api<T> {
        &self.api
    }

    /// Access the shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Access the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether a cycle is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Ask outstanding work to stop.
    ///
    /// Requests not yet dispatched are refused; phases drain normally, and
    /// the commit/rollback accounting stays consistent because the touched
    /// servers end the cycle marked failed. The flag clears when the next
    /// cycle starts.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Timestamp of the last fully successful refresh.
    pub fn last_successful_refresh(&self) -> Option<DateTime<Utc>> {
        self.state().last_successful_refresh
    }

    /// The user-visible refresh state as of `now`.
    pub fn refresh_status(&self, now: DateTime<Utc>) -> RefreshStatus {
        if self.is_refreshing() {
            return RefreshStatus::Refreshing;
        }
        let failed = { !store::lock(&self.store).all_servers_ok() };
        if failed {
            return RefreshStatus::Failed;
        }
        match self.state().last_successful_refresh {
            Some(t) => RefreshStatus::Updated {
                seconds_ago: (now - t).num_seconds(),
            },
            None => RefreshStatus::Updated { seconds_ago: 0 },
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn throttle(&self) -> MutexGuard<'_, RefreshThrottle> {
        self.throttle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run one full sync cycle. Returns true when every credentialed server
/// synced cleanly.
pub async fn sync_all<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) -> bool {
    ctx.cancel.store(false, Ordering::Relaxed);
    ctx.refreshing.store(true, Ordering::SeqCst);
    emit(ctx.progress.as_deref(), SyncEvent::RefreshStarted);

    {
        store::lock(&ctx.store).begin_cycle();
    }

    let needs_repo_discovery = {
        let last_check = ctx.state().last_repo_check;
        let visible = store::lock(&ctx.store).visible_repo_count();
        match last_check {
            None => true,
            Some(t) => visible == 0 || Utc::now() - t > ctx.settings.new_repo_check_period,
        }
    };

    if needs_repo_discovery {
        fetch_repositories(ctx).await;
    } else {
        store::lock(&ctx.store).reset_sync_success();
        ensure_user_ids(ctx).await;
    }

    super::dirty::mark_dirty_repos(ctx).await;

    {
        let mut store = store::lock(&ctx.store);
        for repo_id in store.unsyncable_repo_ids() {
            store.drop_items_of_repo(repo_id);
        }
    }

    fetch_items(ctx).await;
    update_items(ctx).await;

    let success = complete_sync(ctx);
    ctx.refreshing.store(false, Ordering::SeqCst);
    emit(ctx.progress.as_deref(), SyncEvent::RefreshEnded { success });
    success
}

/// Resync user identity and the watched-repository list on every server.
///
/// Everything is presumed deleted until the subscriptions listing observes
/// it again; repos seen for the first time honor the hide-by-default
/// setting.
async fn fetch_repositories<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    {
        store::lock(&ctx.store).reset_sync_success();
    }
    sync_user_details(ctx).await;
    {
        store::lock(&ctx.store).mark_all_repos_delete();
    }

    let server_ids = { store::lock(&ctx.store).good_server_ids() };
    let mut handles = Vec::with_capacity(server_ids.len());
    for server_id in server_ids {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            sync_watched_repos(task_ctx, server_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let announce = {
        let mut store = store::lock(&ctx.store);
        let hide = ctx.settings.hide_new_repositories;
        let new_ids = store.new_repo_ids();
        for repo_id in &new_ids {
            if let Some(repo) = store.repo_mut(*repo_id) {
                repo.hidden = hide;
            }
        }
        if hide { Vec::new() } else { new_ids }
    };
    for repo_id in announce {
        emit(ctx.progress.as_deref(), SyncEvent::NewRepo { repo_id });
    }

    ctx.state().last_repo_check = Some(Utc::now());
}

async fn sync_watched_repos<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    server_id: Uuid,
) {
    let now = Utc::now();
    let outcome = ctx
        .api
        .get_paged("/user/subscriptions", server_id, &[], |items, _last| {
            let mut store = store::lock(&ctx.store);
            for value in items {
                match serde_json::from_value::<RemoteRepo>(value.clone()) {
                    Ok(remote) => {
                        if remote.is_readable() {
                            store.upsert_repo(&remote, server_id, now);
                        } else {
                            tracing::debug!(
                                repo = %remote.full_name,
                                "watched private repository seems to be inaccessible, skipping"
                            );
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "skipping undecodable subscription entry"),
                }
            }
            PageFlow::Continue
        })
        .await;

    if outcome.is_err() {
        tracing::warn!(%server_id, "error while fetching watched repositories");
        store::lock(&ctx.store).mark_sync_failed(server_id);
    }
}

/// Fetch `/user` on every credentialed server, recording login and id.
async fn sync_user_details<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let server_ids = { store::lock(&ctx.store).good_server_ids() };
    let mut handles = Vec::with_capacity(server_ids.len());
    for server_id in server_ids {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            match task_ctx.api.get("/user", server_id, false, &[], &[]).await {
                Ok(resp) => match serde_json::from_value::<RemoteUser>(resp.value) {
                    Ok(user) => {
                        let mut store = store::lock(&task_ctx.store);
                        if let Some(server) = store.server_mut(server_id) {
                            server.user_name = Some(user.login);
                            server.user_id = Some(user.id);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%server_id, error = %e, "could not read user credentials");
                        store::lock(&task_ctx.store).mark_sync_failed(server_id);
                    }
                },
                Err(e) => {
                    tracing::debug!(%server_id, error = %e, "could not read user credentials");
                    store::lock(&task_ctx.store).mark_sync_failed(server_id);
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Backfill user identity on servers that never completed it.
async fn ensure_user_ids<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let needs_check = {
        let store = store::lock(&ctx.store);
        let result = store
            .servers()
            .any(|s| s.good_to_go() && s.user_id.is_none());
        result
    };
    if needs_check {
        tracing::debug!("some servers are missing user details, fetching credentials");
        sync_user_details(ctx).await;
    }
}

/// Fetch item listings for every syncable repository.
async fn fetch_items<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let repo_ids = { store::lock(&ctx.store).syncable_repo_ids() };
    let mut handles = Vec::with_capacity(repo_ids.len());
    for repo_id in repo_ids {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            fetch_items_for_repo(task_ctx, repo_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn fetch_items_for_repo<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    repo_id: i64,
) {
    let (server_id, full_name) = {
        let store = store::lock(&ctx.store);
        match store.repo(repo_id) {
            Some(repo) => (repo.server_id, repo.full_name.clone()),
            None => return,
        }
    };

    // Open items are presumed gone until the listings prove otherwise.
    {
        store::lock(&ctx.store).mark_open_items_delete(repo_id);
    }

    let mut failure: Option<ApiError> = None;
    for (kind, path) in [
        (ItemKind::Pull, format!("/repos/{full_name}/pulls")),
        (ItemKind::Issue, format!("/repos/{full_name}/issues")),
    ] {
        let outcome = ctx
            .api
            .get_paged(&path, server_id, &[], |items, _last| {
                let mut store = store::lock(&ctx.store);
                for value in items {
                    match serde_json::from_value::<RemoteItem>(value.clone()) {
                        Ok(remote) => {
                            // The issues listing shadows every pull request.
                            if kind == ItemKind::Issue && remote.is_pull_shadow() {
                                continue;
                            }
                            store.upsert_item(&remote, kind, repo_id, server_id);
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping undecodable listing entry");
                        }
                    }
                }
                PageFlow::Continue
            })
            .await;

        if let Err(e) = outcome {
            failure = Some(e);
            break;
        }
    }

    let mut store = store::lock(&ctx.store);
    if let Some(repo) = store.repo_mut(repo_id) {
        repo.dirty = false;
    }
    match failure {
        None => {}
        Some(ApiError::Gone { status: 410 }) => {
            // Gone for good.
            if let Some(repo) = store.repo_mut(repo_id) {
                repo.disposition = Disposition::Delete;
            }
        }
        Some(ApiError::Gone { .. }) => {
            // Disabled or access revoked; keep the repo but drop its items.
            if let Some(repo) = store.repo_mut(repo_id) {
                repo.inaccessible = true;
                repo.disposition = Disposition::DoNothing;
            }
            store.drop_items_of_repo(repo_id);
        }
        Some(_) => {
            store.mark_sync_failed(server_id);
        }
    }
}

/// The concurrent child phases: comments, labels, statuses, closure checks
/// and assignment checks all run at once; the stage completes when every
/// sub-operation has.
async fn update_items<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let scan_labels = prepare_label_scan(ctx);
    let scan_statuses = prepare_status_scan(ctx);

    tokio::join!(
        fetch_comments(ctx),
        async {
            if scan_labels {
                fetch_labels(ctx).await;
            }
        },
        async {
            if scan_statuses {
                fetch_statuses(ctx).await;
            }
        },
        check_closures(ctx),
        detect_assignments(ctx),
    );
}

fn prepare_label_scan<T: HttpTransport>(ctx: &Arc<SyncContext<T>>) -> bool {
    if ctx.settings.show_labels {
        return true;
    }
    ctx.throttle().clear(ChildKind::Labels);
    store::lock(&ctx.store).remove_all_labels();
    false
}

fn prepare_status_scan<T: HttpTransport>(ctx: &Arc<SyncContext<T>>) -> bool {
    if ctx.settings.show_statuses {
        return true;
    }
    ctx.throttle().clear(ChildKind::Statuses);
    store::lock(&ctx.store).remove_all_statuses();
    false
}

/// Refresh both comment collections of every new or updated item.
async fn fetch_comments<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let item_ids = { store::lock(&ctx.store).new_or_updated_item_ids() };
    {
        let mut store = store::lock(&ctx.store);
        for item_id in &item_ids {
            store.mark_comments_delete(*item_id);
        }
    }

    let mut handles = Vec::with_capacity(item_ids.len());
    for item_id in item_ids {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            fetch_comments_for_item(task_ctx, item_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn fetch_comments_for_item<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    item_id: i64,
) {
    let (server_id, links) = {
        let store = store::lock(&ctx.store);
        match store.item(item_id) {
            Some(item) => {
                let links: Vec<String> = [
                    item.comments_url.clone(),
                    item.review_comments_url.clone(),
                ]
                .into_iter()
                .flatten()
                .collect();
                (item.server_id, links)
            }
            None => return,
        }
    };

    for link in links {
        let outcome = ctx
            .api
            .get_paged(&link, server_id, &[], |items, _last| {
                let mut store = store::lock(&ctx.store);
                for value in items {
                    match serde_json::from_value::<RemoteComment>(value.clone()) {
                        Ok(remote) => store.upsert_comment(&remote, item_id, server_id),
                        Err(e) => tracing::debug!(error = %e, "skipping undecodable comment"),
                    }
                }
                PageFlow::Continue
            })
            .await;

        if outcome.is_err() {
            store::lock(&ctx.store).mark_sync_failed(server_id);
        }
    }
}

/// Refresh label collections of throttle-eligible items.
async fn fetch_labels<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let interval = ctx.settings.label_refresh_interval;
    let candidates = { store::lock(&ctx.store).item_ids() };
    let eligible: Vec<i64> = {
        let mut throttle = ctx.throttle();
        candidates
            .into_iter()
            .filter(|id| throttle.check(*id, ChildKind::Labels, interval))
            .collect()
    };

    let mut handles = Vec::with_capacity(eligible.len());
    for item_id in eligible {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            fetch_labels_for_item(task_ctx, item_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn fetch_labels_for_item<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    item_id: i64,
) {
    let (server_id, link) = {
        let store = store::lock(&ctx.store);
        match store.item(item_id) {
            Some(item) => (item.server_id, item.labels_url.clone()),
            None => return,
        }
    };

    {
        store::lock(&ctx.store).mark_labels_delete(item_id);
    }

    let all_good = match link {
        Some(link) => {
            let outcome = ctx
                .api
                .get_paged(&link, server_id, &[], |items, _last| {
                    let mut store = store::lock(&ctx.store);
                    for value in items {
                        match serde_json::from_value::<RemoteLabel>(value.clone()) {
                            Ok(remote) => store.upsert_label(&remote, item_id, server_id),
                            Err(e) => tracing::debug!(error = %e, "skipping undecodable label"),
                        }
                    }
                    PageFlow::Continue
                })
                .await;
            match outcome {
                Ok(_) => true,
                // The label collection has been deleted; nothing there.
                Err(e) if e.is_gone() => true,
                Err(_) => {
                    store::lock(&ctx.store).mark_sync_failed(server_id);
                    false
                }
            }
        }
        // No labels link, so presumably no labels.
        None => true,
    };

    if all_good {
        ctx.throttle().mark_refreshed(item_id, ChildKind::Labels);
    }
}

/// Refresh status collections of throttle-eligible items.
async fn fetch_statuses<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let interval = ctx.settings.status_refresh_interval;
    let candidates = { store::lock(&ctx.store).item_ids() };
    let eligible: Vec<i64> = {
        let mut throttle = ctx.throttle();
        candidates
            .into_iter()
            .filter(|id| throttle.check(*id, ChildKind::Statuses, interval))
            .collect()
    };

    let mut handles = Vec::with_capacity(eligible.len());
    for item_id in eligible {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            fetch_statuses_for_item(task_ctx, item_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn fetch_statuses_for_item<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    item_id: i64,
) {
    let (server_id, link) = {
        let store = store::lock(&ctx.store);
        match store.item(item_id) {
            Some(item) => (item.server_id, item.statuses_url.clone()),
            None => return,
        }
    };

    {
        store::lock(&ctx.store).mark_statuses_delete(item_id);
    }

    let all_good = match link {
        Some(link) => {
            let outcome = ctx
                .api
                .get_paged(&link, server_id, &[], |items, _last| {
                    let mut store = store::lock(&ctx.store);
                    for value in items {
                        match serde_json::from_value::<RemoteStatus>(value.clone()) {
                            Ok(remote) => store.upsert_status(&remote, item_id, server_id),
                            Err(e) => tracing::debug!(error = %e, "skipping undecodable status"),
                        }
                    }
                    PageFlow::Continue
                })
                .await;
            match outcome {
                Ok(_) => true,
                Err(e) if e.is_gone() => true,
                Err(_) => {
                    store::lock(&ctx.store).mark_sync_failed(server_id);
                    false
                }
            }
        }
        None => true,
    };

    if all_good {
        ctx.throttle().mark_refreshed(item_id, ChildKind::Statuses);
    }
}

/// For every pull that vanished from its listing while recorded open,
/// re-fetch the single item to distinguish merge from closure.
async fn check_closures<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let item_ids = { store::lock(&ctx.store).closure_check_item_ids() };
    let mut handles = Vec::with_capacity(item_ids.len());
    for item_id in item_ids {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            investigate_closure(task_ctx, item_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn investigate_closure<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    item_id: i64,
) {
    let (server_id, path, my_user_id) = {
        let store = store::lock(&ctx.store);
        let Some(item) = store.item(item_id) else { return };
        let Some(repo) = store.repo(item.repo_id) else {
            return;
        };
        let my_user_id = store.server(item.server_id).and_then(|s| s.user_id);
        (
            item.server_id,
            format!("/repos/{}/pulls/{}", repo.full_name, item.number),
            my_user_id,
        )
    };

    tracing::debug!(item_id, "checking closed item to see if it was merged");
    match ctx.api.get(&path, server_id, false, &[], &[]).await {
        Ok(resp) => match serde_json::from_value::<RemoteItem>(resp.value) {
            Ok(detail) => {
                if let Some(merger) = detail.merged_by {
                    let merged_by_me = my_user_id == Some(merger.id);
                    if merged_by_me && ctx.settings.dont_keep_my_merges {
                        tracing::debug!(item_id, "dropping item merged by the current user");
                    } else {
                        conclude_closure(
                            &ctx,
                            item_id,
                            ctx.settings.merge_handling,
                            Condition::Merged,
                        );
                    }
                } else {
                    conclude_closure(
                        &ctx,
                        item_id,
                        ctx.settings.close_handling,
                        Condition::Closed,
                    );
                }
            }
            Err(e) => {
                tracing::debug!(item_id, error = %e, "could not decode item detail");
                abort_closure(&ctx, item_id, server_id);
            }
        },
        Err(e) if e.is_gone() => {
            // The item no longer exists at all; treat as closed.
            conclude_closure(&ctx, item_id, ctx.settings.close_handling, Condition::Closed);
        }
        Err(_) => abort_closure(&ctx, item_id, server_id),
    }
}

/// Classification failed; keep the item rather than guess, and record the
/// server failure so the cycle's changes are discarded.
fn abort_closure<T: HttpTransport>(ctx: &SyncContext<T>, item_id: i64, server_id: Uuid) {
    let mut store = store::lock(&ctx.store);
    if let Some(item) = store.item_mut(item_id) {
        item.disposition = Disposition::DoNothing;
    }
    store.mark_sync_failed(server_id);
}

/// Apply the configured handling policy to a merged/closed item.
///
/// Keep-mine deliberately excludes items filed under the catch-all section;
/// keep-all has no such exception. Anything else lets the delete stand.
fn conclude_closure<T: HttpTransport>(
    ctx: &SyncContext<T>,
    item_id: i64,
    policy: HandlingPolicy,
    condition: Condition,
) {
    let mut store = store::lock(&ctx.store);
    let Some(item) = store.item_mut(item_id) else {
        return;
    };
    let keep = match policy {
        HandlingPolicy::KeepMine => item.section != Section::All,
        HandlingPolicy::KeepAll => true,
        HandlingPolicy::Discard => false,
    };
    if !keep {
        return;
    }
    item.disposition = Disposition::DoNothing;
    item.condition = condition;
    drop(store);

    let event = match condition {
        Condition::Merged => SyncEvent::ItemMerged { item_id },
        _ => SyncEvent::ItemClosed { item_id },
    };
    emit(ctx.progress.as_deref(), event);
}

/// Compare each new/updated item's assignee against the authenticated user.
async fn detect_assignments<T: HttpTransport + 'static>(ctx: &Arc<SyncContext<T>>) {
    let item_ids = { store::lock(&ctx.store).new_or_updated_item_ids() };
    let mut handles = Vec::with_capacity(item_ids.len());
    for item_id in item_ids {
        let task_ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            detect_assignment_for_item(task_ctx, item_id).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn detect_assignment_for_item<T: HttpTransport + 'static>(
    ctx: Arc<SyncContext<T>>,
    item_id: i64,
) {
    let (server_id, link, my_login) = {
        let store = store::lock(&ctx.store);
        let Some(item) = store.item(item_id) else { return };
        let my_login = store
            .server(item.server_id)
            .and_then(|s| s.user_name.clone());
        (item.server_id, item.issue_url.clone(), my_login)
    };
    let Some(link) = link else { return };

    match ctx.api.get(&link, server_id, false, &[], &[]).await {
        Ok(resp) => match serde_json::from_value::<RemoteItem>(resp.value) {
            Ok(detail) => {
                let assignee = detail.assignee.map(|u| u.login);
                let assigned = match (&assignee, &my_login) {
                    (Some(a), Some(mine)) => a == mine,
                    _ => false,
                };
                let newly_assigned = {
                    let mut store = store::lock(&ctx.store);
                    match store.item_mut(item_id) {
                        Some(item) => {
                            // Only the unassigned -> assigned transition counts.
                            item.is_new_assignment = assigned && !item.assigned_to_me;
                            item.assigned_to_me = assigned;
                            item.is_new_assignment
                        }
                        None => false,
                    }
                };
                if newly_assigned {
                    emit(ctx.progress.as_deref(), SyncEvent::NewAssignment { item_id });
                }
            }
            Err(e) => {
                tracing::debug!(item_id, error = %e, "could not decode issue detail");
                store::lock(&ctx.store).mark_sync_failed(server_id);
            }
        },
        Err(e) if e.is_gone() => {
            // The issue record legitimately doesn't exist.
            let mut store = store::lock(&ctx.store);
            if let Some(item) = store.item_mut(item_id) {
                item.assigned_to_me = false;
                item.is_new_assignment = false;
            }
        }
        Err(_) => {
            store::lock(&ctx.store).mark_sync_failed(server_id);
        }
    }
}

/// Per-server reconciliation, then the physical commit.
///
/// Servers that failed have everything they touched this cycle discarded,
/// and their failed flag re-asserted on the restored record. Only then are
/// delete-flagged objects removed for good.
fn complete_sync<T: HttpTransport>(ctx: &SyncContext<T>) -> bool {
    let success = {
        let mut store = store::lock(&ctx.store);
        let failed: Vec<Uuid> = store
            .servers()
            .filter(|s| s.good_to_go() && !s.last_sync_succeeded)
            .map(|s| s.id)
            .collect();
        for server_id in &failed {
            store.rollback_server(*server_id);
            // The rollback restored the snapshot's flag; this one stays.
            store.mark_sync_failed(*server_id);
        }
        store.commit();
        failed.is_empty()
    };

    if success {
        ctx.state().last_successful_refresh = Some(Utc::now());
    }
    success
}
