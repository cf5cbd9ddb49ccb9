//! The transactional object store.
//!
//! Persistence technology is an external concern; the engine works against
//! this in-memory store, which provides the contract the sync cycle needs:
//! entity upserts driven by remote payloads, queries by disposition and
//! dirtiness, a snapshot taken at the start of each cycle, rollback of one
//! server's pending changes while leaving other servers' work intact, and a
//! commit that physically removes everything flagged for deletion.

mod entity;
mod remote;

pub use entity::{
    Comment, Condition, Disposition, EventCursor, Item, ItemKind, Label, Repo, Section, Server,
    Status, StreamKind,
};
pub use remote::{
    RemoteComment, RemoteEvent, RemoteEventRepo, RemoteItem, RemoteLabel, RemotePermissions,
    RemoteRepo, RemoteStatus, RemoteUser,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Store handle shared between the engine and the request layer.
///
/// One writer context per sync cycle; the mutex serializes the concurrent
/// completion callbacks that apply fetched data.
pub type SharedStore = Arc<Mutex<Store>>;

/// Wrap a store for sharing.
#[must_use]
pub fn shared(store: Store) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store, recovering from poisoning.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    servers: HashMap<Uuid, Server>,
    repos: HashMap<i64, Repo>,
    items: HashMap<i64, Item>,
    comments: HashMap<(i64, i64), Comment>,
    labels: HashMap<(i64, i64), Label>,
    statuses: HashMap<(i64, i64), Status>,
}

/// The in-memory object store.
///
/// Child entities are keyed by `(item_id, remote_id)` since remote label ids
/// are shared across the items they are attached to.
#[derive(Debug, Default)]
pub struct Store {
    servers: HashMap<Uuid, Server>,
    repos: HashMap<i64, Repo>,
    items: HashMap<i64, Item>,
    comments: HashMap<(i64, i64), Comment>,
    labels: HashMap<(i64, i64), Label>,
    statuses: HashMap<(i64, i64), Status>,
    snapshot: Option<Box<Snapshot>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---------- servers ----------

    pub fn add_server(&mut self, server: Server) -> Uuid {
        let id = server.id;
        self.servers.insert(id, server);
        id
    }

    #[must_use]
    pub fn server(&self, id: Uuid) -> Option<&Server> {
        self.servers.get(&id)
    }

    pub fn server_mut(&mut self, id: Uuid) -> Option<&mut Server> {
        self.servers.get_mut(&id)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    /// Ids of servers with usable credentials.
    #[must_use]
    pub fn good_server_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .servers
            .values()
            .filter(|s| s.good_to_go())
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    /// Reset the per-cycle success flag on every credentialed server.
    pub fn reset_sync_success(&mut self) {
        for server in self.servers.values_mut() {
            if server.good_to_go() {
                server.last_sync_succeeded = true;
            }
        }
    }

    pub fn mark_sync_failed(&mut self, id: Uuid) {
        if let Some(server) = self.servers.get_mut(&id) {
            server.last_sync_succeeded = false;
        }
    }

    /// True when no credentialed server failed this cycle.
    #[must_use]
    pub fn all_servers_ok(&self) -> bool {
        self.servers
            .values()
            .filter(|s| s.good_to_go())
            .all(|s| s.last_sync_succeeded)
    }

    // ---------- repositories ----------

    #[must_use]
    pub fn repo(&self, id: i64) -> Option<&Repo> {
        self.repos.get(&id)
    }

    pub fn repo_mut(&mut self, id: i64) -> Option<&mut Repo> {
        self.repos.get_mut(&id)
    }

    pub fn repos(&self) -> impl Iterator<Item = &Repo> {
        self.repos.values()
    }

    #[must_use]
    pub fn visible_repo_count(&self) -> usize {
        self.repos.values().filter(|r| r.is_visible()).count()
    }

    /// Repos whose items will be fetched this cycle.
    #[must_use]
    pub fn syncable_repo_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .repos
            .values()
            .filter(|r| r.is_syncable())
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Repos whose locally held items must be dropped instead of synced.
    #[must_use]
    pub fn unsyncable_repo_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .repos
            .values()
            .filter(|r| r.hidden || r.inaccessible)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Repo discovery pre-pass: everything is presumed deleted until the
    /// subscriptions listing re-observes it.
    pub fn mark_all_repos_delete(&mut self) {
        for repo in self.repos.values_mut() {
            repo.disposition = Disposition::Delete;
            repo.inaccessible = false;
        }
    }

    /// Apply a repository from a watched-repositories listing.
    pub fn upsert_repo(&mut self, remote: &RemoteRepo, server_id: Uuid, now: DateTime<Utc>) {
        match self.repos.get_mut(&remote.id) {
            Some(repo) => {
                repo.disposition = if repo.updated_at != remote.updated_at {
                    Disposition::Updated
                } else {
                    Disposition::DoNothing
                };
                repo.full_name = remote.full_name.clone();
                repo.updated_at = remote.updated_at;
                repo.server_id = server_id;
                repo.inaccessible = false;
            }
            None => {
                self.repos.insert(
                    remote.id,
                    Repo {
                        id: remote.id,
                        server_id,
                        full_name: remote.full_name.clone(),
                        hidden: false,
                        inaccessible: false,
                        dirty: true,
                        last_dirtied: Some(now),
                        updated_at: remote.updated_at,
                        disposition: Disposition::New,
                    },
                );
            }
        }
    }

    #[must_use]
    pub fn new_repo_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .repos
            .values()
            .filter(|r| r.disposition == Disposition::New)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Mark the given repos dirty. Returns how many were actually flagged.
    pub fn mark_repos_dirty(&mut self, ids: &HashSet<i64>, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for id in ids {
            if let Some(repo) = self.repos.get_mut(id) {
                repo.dirty = true;
                repo.last_dirtied = Some(now);
                marked += 1;
            }
        }
        marked
    }

    /// Safety net against missed events: force-dirty repos untouched since
    /// `cutoff`. Returns how many were flagged.
    pub fn mark_stale_repos_dirty(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for repo in self.repos.values_mut() {
            if !repo.dirty && matches!(repo.last_dirtied, Some(t) if t < cutoff) {
                repo.dirty = true;
                repo.last_dirtied = Some(now);
                marked += 1;
            }
        }
        marked
    }

    // ---------- items ----------

    #[must_use]
    pub fn item(&self, id: i64) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn item_mut(&mut self, id: i64) -> Option<&mut Item> {
        self.items.get_mut(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    #[must_use]
    pub fn item_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.items.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn new_or_updated_item_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .items
            .values()
            .filter(|i| i.disposition.is_new_or_updated())
            .map(|i| i.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Open items of a repo are presumed deleted until the listing
    /// re-observes them.
    pub fn mark_open_items_delete(&mut self, repo_id: i64) {
        for item in self.items.values_mut() {
            if item.repo_id == repo_id && item.condition == Condition::Open {
                item.disposition = Disposition::Delete;
            }
        }
    }

    /// Physically drop a repo's items and their children, keeping the repo.
    pub fn drop_items_of_repo(&mut self, repo_id: i64) {
        let doomed: Vec<i64> = self
            .items
            .values()
            .filter(|i| i.repo_id == repo_id)
            .map(|i| i.id)
            .collect();
        for id in doomed {
            self.remove_item(id);
        }
    }

    fn remove_item(&mut self, item_id: i64) {
        self.items.remove(&item_id);
        self.comments.retain(|_, c| c.item_id != item_id);
        self.labels.retain(|_, l| l.item_id != item_id);
        self.statuses.retain(|_, s| s.item_id != item_id);
    }

    /// Apply an item from a pulls/issues listing.
    pub fn upsert_item(
        &mut self,
        remote: &RemoteItem,
        kind: ItemKind,
        repo_id: i64,
        server_id: Uuid,
    ) {
        let issue_url = remote.effective_issue_url();
        let labels_url = remote.effective_labels_url();
        match self.items.get_mut(&remote.id) {
            Some(item) => {
                let changed = item.updated_at != remote.updated_at;
                item.disposition = if changed {
                    Disposition::Updated
                } else {
                    Disposition::DoNothing
                };
                if changed {
                    item.title = remote.title.clone().unwrap_or_default();
                    item.condition = Condition::from_state(remote.state.as_deref());
                    item.updated_at = remote.updated_at;
                    item.issue_url = issue_url;
                    item.comments_url = remote.comments_url.clone();
                    item.review_comments_url = remote.review_comments_url.clone();
                    item.labels_url = labels_url;
                    item.statuses_url = remote.statuses_url.clone();
                }
            }
            None => {
                self.items.insert(
                    remote.id,
                    Item {
                        id: remote.id,
                        repo_id,
                        server_id,
                        kind,
                        number: remote.number,
                        title: remote.title.clone().unwrap_or_default(),
                        condition: Condition::from_state(remote.state.as_deref()),
                        disposition: Disposition::New,
                        section: Section::Unlisted,
                        updated_at: remote.updated_at,
                        assigned_to_me: false,
                        is_new_assignment: false,
                        latest_read_comment_at: None,
                        issue_url,
                        comments_url: remote.comments_url.clone(),
                        review_comments_url: remote.review_comments_url.clone(),
                        labels_url,
                        statuses_url: remote.statuses_url.clone(),
                    },
                );
            }
        }
    }

    /// Pull items whose computed disposition is delete while still recorded
    /// open, in a visible repo that is not itself being deleted. These get a
    /// targeted re-fetch to distinguish merge from closure.
    #[must_use]
    pub fn closure_check_item_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .items
            .values()
            .filter(|i| {
                i.kind == ItemKind::Pull
                    && i.disposition == Disposition::Delete
                    && i.condition == Condition::Open
            })
            .filter(|i| {
                self.repos
                    .get(&i.repo_id)
                    .is_some_and(|r| r.is_visible() && r.disposition != Disposition::Delete)
            })
            .map(|i| i.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ---------- child collections ----------

    pub fn mark_comments_delete(&mut self, item_id: i64) {
        for comment in self.comments.values_mut() {
            if comment.item_id == item_id {
                comment.disposition = Disposition::Delete;
            }
        }
    }

    pub fn mark_labels_delete(&mut self, item_id: i64) {
        for label in self.labels.values_mut() {
            if label.item_id == item_id {
                label.disposition = Disposition::Delete;
            }
        }
    }

    pub fn mark_statuses_delete(&mut self, item_id: i64) {
        for status in self.statuses.values_mut() {
            if status.item_id == item_id {
                status.disposition = Disposition::Delete;
            }
        }
    }

    /// Apply a comment from a listing page.
    ///
    /// For items seen for the first time this cycle, the item's read cursor
    /// is fast-forwarded so pre-existing comments don't announce as unread.
    pub fn upsert_comment(&mut self, remote: &RemoteComment, item_id: i64, server_id: Uuid) {
        let disposition = match self.comments.get(&(item_id, remote.id)) {
            Some(existing) if existing.created_at == remote.created_at => Disposition::DoNothing,
            Some(_) => Disposition::Updated,
            None => Disposition::New,
        };
        self.comments.insert(
            (item_id, remote.id),
            Comment {
                id: remote.id,
                item_id,
                server_id,
                created_at: remote.created_at,
                disposition,
            },
        );

        if let Some(item) = self.items.get_mut(&item_id) {
            if item.disposition == Disposition::New
                && remote.created_at > item.latest_read_comment_at
            {
                item.latest_read_comment_at = remote.created_at;
            }
        }
    }

    pub fn upsert_label(&mut self, remote: &RemoteLabel, item_id: i64, server_id: Uuid) {
        let disposition = match self.labels.get(&(item_id, remote.id)) {
            Some(existing) if existing.name == remote.name && existing.color == remote.color => {
                Disposition::DoNothing
            }
            Some(_) => Disposition::Updated,
            None => Disposition::New,
        };
        self.labels.insert(
            (item_id, remote.id),
            Label {
                id: remote.id,
                item_id,
                server_id,
                name: remote.name.clone(),
                color: remote.color.clone(),
                disposition,
            },
        );
    }

    pub fn upsert_status(&mut self, remote: &RemoteStatus, item_id: i64, server_id: Uuid) {
        let disposition = match self.statuses.get(&(item_id, remote.id)) {
            Some(existing) if existing.state == remote.state => Disposition::DoNothing,
            Some(_) => Disposition::Updated,
            None => Disposition::New,
        };
        self.statuses.insert(
            (item_id, remote.id),
            Status {
                id: remote.id,
                item_id,
                server_id,
                state: remote.state.clone(),
                context: remote.context.clone(),
                created_at: remote.created_at,
                disposition,
            },
        );
    }

    pub fn comments_of_item(&self, item_id: i64) -> Vec<&Comment> {
        let mut out: Vec<&Comment> = self
            .comments
            .values()
            .filter(|c| c.item_id == item_id)
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn labels_of_item(&self, item_id: i64) -> Vec<&Label> {
        let mut out: Vec<&Label> = self
            .labels
            .values()
            .filter(|l| l.item_id == item_id)
            .collect();
        out.sort_by_key(|l| l.id);
        out
    }

    pub fn statuses_of_item(&self, item_id: i64) -> Vec<&Status> {
        let mut out: Vec<&Status> = self
            .statuses
            .values()
            .filter(|s| s.item_id == item_id)
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Drop every label, physically. Used when the labels feature is
    /// switched off.
    pub fn remove_all_labels(&mut self) {
        self.labels.clear();
    }

    /// Drop every status, physically. Used when the statuses feature is
    /// switched off.
    pub fn remove_all_statuses(&mut self) {
        self.statuses.clear();
    }

    // ---------- transaction ----------

    /// Begin a sync cycle: snapshot the current state so per-server rollback
    /// has something to restore to.
    pub fn begin_cycle(&mut self) {
        self.snapshot = Some(Box::new(Snapshot {
            servers: self.servers.clone(),
            repos: self.repos.clone(),
            items: self.items.clone(),
            comments: self.comments.clone(),
            labels: self.labels.clone(),
            statuses: self.statuses.clone(),
        }));
    }

    /// Discard every pending create/update/delete attributable to one
    /// server, restoring its objects (the server record included) to the
    /// snapshot taken at cycle start. Other servers' changes are untouched.
    pub fn rollback_server(&mut self, server_id: Uuid) {
        let Some(snapshot) = self.snapshot.as_deref() else {
            return;
        };

        let snap_server = snapshot.servers.get(&server_id).cloned();
        let snap_repos: Vec<Repo> = snapshot
            .repos
            .values()
            .filter(|r| r.server_id == server_id)
            .cloned()
            .collect();
        let snap_items: Vec<Item> = snapshot
            .items
            .values()
            .filter(|i| i.server_id == server_id)
            .cloned()
            .collect();
        let snap_comments: Vec<Comment> = snapshot
            .comments
            .values()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect();
        let snap_labels: Vec<Label> = snapshot
            .labels
            .values()
            .filter(|l| l.server_id == server_id)
            .cloned()
            .collect();
        let snap_statuses: Vec<Status> = snapshot
            .statuses
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect();

        self.repos.retain(|_, r| r.server_id != server_id);
        self.items.retain(|_, i| i.server_id != server_id);
        self.comments.retain(|_, c| c.server_id != server_id);
        self.labels.retain(|_, l| l.server_id != server_id);
        self.statuses.retain(|_, s| s.server_id != server_id);

        for repo in snap_repos {
            self.repos.insert(repo.id, repo);
        }
        for item in snap_items {
            self.items.insert(item.id, item);
        }
        for comment in snap_comments {
            self.comments.insert((comment.item_id, comment.id), comment);
        }
        for label in snap_labels {
            self.labels.insert((label.item_id, label.id), label);
        }
        for status in snap_statuses {
            self.statuses.insert((status.item_id, status.id), status);
        }
        if let Some(server) = snap_server {
            self.servers.insert(server_id, server);
        }
    }

    /// End the cycle: physically remove everything flagged for deletion
    /// (children cascade with their parents), consume the surviving
    /// dispositions and drop the snapshot.
    pub fn commit(&mut self) {
        let dead_repos: Vec<i64> = self
            .repos
            .values()
            .filter(|r| r.disposition == Disposition::Delete)
            .map(|r| r.id)
            .collect();
        for repo_id in dead_repos {
            self.drop_items_of_repo(repo_id);
            self.repos.remove(&repo_id);
        }

        let dead_items: Vec<i64> = self
            .items
            .values()
            .filter(|i| i.disposition == Disposition::Delete)
            .map(|i| i.id)
            .collect();
        for item_id in dead_items {
            self.remove_item(item_id);
        }

        self.comments
            .retain(|_, c| c.disposition != Disposition::Delete);
        self.labels
            .retain(|_, l| l.disposition != Disposition::Delete);
        self.statuses
            .retain(|_, s| s.disposition != Disposition::Delete);

        for repo in self.repos.values_mut() {
            repo.disposition = Disposition::DoNothing;
        }
        for item in self.items.values_mut() {
            item.disposition = Disposition::DoNothing;
        }
        for comment in self.comments.values_mut() {
            comment.disposition = Disposition::DoNothing;
        }
        for label in self.labels.values_mut() {
            label.disposition = Disposition::DoNothing;
        }
        for status in self.statuses.values_mut() {
            status.disposition = Disposition::DoNothing;
        }

        self.snapshot = None;
    }
}
