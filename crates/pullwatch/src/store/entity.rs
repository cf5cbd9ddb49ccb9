//! Stored entities and their closed enumerations.
//!
//! The integer raw values of these enums are a persisted contract (they are
//! what an on-disk store would record); the mappings must stay stable.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// What the commit phase should do with an entity once the cycle ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    DoNothing,
    Delete,
    New,
    Updated,
}

impl Disposition {
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            Disposition::DoNothing => 0,
            Disposition::Delete => 1,
            Disposition::New => 2,
            Disposition::Updated => 3,
        }
    }

    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Disposition::DoNothing),
            1 => Some(Disposition::Delete),
            2 => Some(Disposition::New),
            3 => Some(Disposition::Updated),
            _ => None,
        }
    }

    /// True for entities the commit phase will keep.
    #[must_use]
    pub fn survives(self) -> bool {
        self != Disposition::Delete
    }

    #[must_use]
    pub fn is_new_or_updated(self) -> bool {
        matches!(self, Disposition::New | Disposition::Updated)
    }
}

/// Remote lifecycle state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Open,
    Closed,
    Merged,
}

impl Condition {
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            Condition::Open => 0,
            Condition::Closed => 1,
            Condition::Merged => 2,
        }
    }

    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Condition::Open),
            1 => Some(Condition::Closed),
            2 => Some(Condition::Merged),
            _ => None,
        }
    }

    /// Interpret a listing payload's `state` field.
    #[must_use]
    pub fn from_state(state: Option<&str>) -> Self {
        match state {
            Some("closed") => Condition::Closed,
            _ => Condition::Open,
        }
    }
}

/// Whether an item is a pull request or an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Pull,
    Issue,
}

impl ItemKind {
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            ItemKind::Pull => 0,
            ItemKind::Issue => 1,
        }
    }

    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(ItemKind::Pull),
            1 => Some(ItemKind::Issue),
            _ => None,
        }
    }
}

/// The list section an item is currently filed under.
///
/// Section assignment itself is presentation-layer post-processing; the core
/// stores the value because the keep-mine close/merge policy treats items in
/// the catch-all [`Section::All`] differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Unlisted,
    Mine,
    Participated,
    Merged,
    Closed,
    All,
}

impl Section {
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            Section::Unlisted => 0,
            Section::Mine => 1,
            Section::Participated => 2,
            Section::Merged => 3,
            Section::Closed => 4,
            Section::All => 5,
        }
    }

    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Section::Unlisted),
            1 => Some(Section::Mine),
            2 => Some(Section::Participated),
            3 => Some(Section::Merged),
            4 => Some(Section::Closed),
            5 => Some(Section::All),
            _ => None,
        }
    }
}

/// Cursor state for one event stream on a server.
///
/// A `None` timestamp is the "never synced" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCursor {
    pub latest_event_at: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// The two independent event streams consulted for dirty detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    UserEvents,
    ReceivedEvents,
}

/// An upstream API server.
///
/// Owned by the configuration layer; the core mutates it every cycle but
/// never destroys it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: Uuid,
    pub label: String,
    pub api_base: String,
    pub auth_token: Option<String>,
    pub user_name: Option<String>,
    pub user_id: Option<i64>,
    pub requests_remaining: Option<i64>,
    pub requests_limit: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub last_sync_succeeded: bool,
    pub user_events: EventCursor,
    pub received_events: EventCursor,
}

impl Server {
    pub fn new(
        label: impl Into<String>,
        api_base: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            api_base: api_base.into(),
            auth_token,
            user_name: None,
            user_id: None,
            requests_remaining: None,
            requests_limit: None,
            reset_at: None,
            last_sync_succeeded: true,
            user_events: EventCursor::default(),
            received_events: EventCursor::default(),
        }
    }

    /// A server is usable at all only when it has credentials.
    #[must_use]
    pub fn good_to_go(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    #[must_use]
    pub fn cursor(&self, kind: StreamKind) -> &EventCursor {
        match kind {
            StreamKind::UserEvents => &self.user_events,
            StreamKind::ReceivedEvents => &self.received_events,
        }
    }

    pub fn cursor_mut(&mut self, kind: StreamKind) -> &mut EventCursor {
        match kind {
            StreamKind::UserEvents => &mut self.user_events,
            StreamKind::ReceivedEvents => &mut self.received_events,
        }
    }
}

/// A watched repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: i64,
    pub server_id: Uuid,
    pub full_name: String,
    pub hidden: bool,
    pub inaccessible: bool,
    pub dirty: bool,
    pub last_dirtied: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub disposition: Disposition,
}

impl Repo {
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.hidden
    }

    /// Repos whose items are fetched this cycle.
    #[must_use]
    pub fn is_syncable(&self) -> bool {
        self.dirty && !self.hidden && !self.inaccessible
    }
}

/// A pull request or issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: i64,
    pub repo_id: i64,
    pub server_id: Uuid,
    pub kind: ItemKind,
    pub number: i64,
    pub title: String,
    pub condition: Condition,
    pub disposition: Disposition,
    pub section: Section,
    pub updated_at: Option<DateTime<Utc>>,
    pub assigned_to_me: bool,
    pub is_new_assignment: bool,
    pub latest_read_comment_at: Option<DateTime<Utc>>,
    pub issue_url: Option<String>,
    pub comments_url: Option<String>,
    pub review_comments_url: Option<String>,
    pub labels_url: Option<String>,
    pub statuses_url: Option<String>,
}

/// A comment on an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: i64,
    pub item_id: i64,
    pub server_id: Uuid,
    pub created_at: Option<DateTime<Utc>>,
    pub disposition: Disposition,
}

/// A label attached to an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub id: i64,
    pub item_id: i64,
    pub server_id: Uuid,
    pub name: String,
    pub color: Option<String>,
    pub disposition: Disposition,
}

/// A commit status attached to a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: i64,
    pub item_id: i64,
    pub server_id: Uuid,
    pub state: Option<String>,
    pub context: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub disposition: Disposition,
}
