//! Progress reporting for sync operations.
//!
//! The engine emits [`SyncEvent`]s through an optional callback; the
//! embedding application decides what to render. The only states a user
//! interface needs beyond these events are captured by [`RefreshStatus`].

use std::fmt;

use uuid::Uuid;

/// Events emitted during a sync cycle.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SyncEvent {
    /// A sync cycle started.
    RefreshStarted,

    /// A sync cycle finished.
    RefreshEnded {
        /// True when every credentialed server synced cleanly.
        success: bool,
    },

    /// Rate budget counters were observed on a response.
    ApiUsage {
        /// The server the counters belong to.
        server: Uuid,
        /// Requests remaining in the current window (-1 if not reported).
        remaining: i64,
        /// Total request budget (-1 if not reported).
        limit: i64,
    },

    /// Event-stream deltas marked repositories dirty.
    ReposMarkedDirty {
        /// Number of repositories flagged.
        count: usize,
    },

    /// A repository was seen for the first time.
    NewRepo { repo_id: i64 },

    /// A tracked item turned out to have been merged and was kept.
    ItemMerged { item_id: i64 },

    /// A tracked item turned out to have been closed and was kept.
    ItemClosed { item_id: i64 },

    /// An item transitioned from unassigned to assigned to the current user.
    NewAssignment { item_id: i64 },
}

/// Callback invoked for every [`SyncEvent`].
pub type ProgressCallback = Box<dyn Fn(SyncEvent) + Send + Sync>;

/// Emit an event if a callback is configured.
pub fn emit(callback: Option<&ProgressCallback>, event: SyncEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}

/// The user-visible refresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// A cycle is in flight.
    Refreshing,
    /// The most recent cycle left at least one server failed.
    Failed,
    /// The last cycle succeeded this many seconds ago.
    Updated { seconds_ago: i64 },
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshStatus::Refreshing => write!(f, "Refreshing..."),
            RefreshStatus::Failed => write!(f, "Last update failed"),
            RefreshStatus::Updated { seconds_ago } if *seconds_ago < 10 => {
                write!(f, "Just updated")
            }
            RefreshStatus::Updated { seconds_ago } => {
                write!(f, "Updated {seconds_ago} seconds ago")
            }
        }
    }
}
