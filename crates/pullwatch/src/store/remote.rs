//! Typed deserialization targets for remote API payloads.
//!
//! Listing endpoints return arrays of these objects; detail endpoints return
//! a single one. Fields the engine does not consume are not modeled, and all
//! optional fields default so schema drift does not break a sync.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUser {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemotePermissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub pull: bool,
}

/// A repository as returned by the watched-repositories listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRepo {
    pub id: i64,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub permissions: Option<RemotePermissions>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteRepo {
    /// Whether the authenticated user can actually read this repository.
    ///
    /// Public repos always qualify; private ones need pull, push or admin
    /// permission or their item fetches would just 404.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        if !self.private {
            return true;
        }
        self.permissions
            .as_ref()
            .is_some_and(|p| p.pull || p.push || p.admin)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEventRepo {
    pub id: i64,
}

/// An entry from an event stream, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEvent {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub repo: Option<RemoteEventRepo>,
}

/// A pull request or issue, from either a listing or a detail fetch.
///
/// Pull payloads carry `issue_url`/`review_comments_url`/`statuses_url`;
/// issue payloads carry `url`/`labels_url` and a `pull_request` marker when
/// the entry is just the issue shadow of a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteItem {
    pub id: i64,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments_url: Option<String>,
    #[serde(default)]
    pub review_comments_url: Option<String>,
    #[serde(default)]
    pub statuses_url: Option<String>,
    #[serde(default)]
    pub labels_url: Option<String>,
    #[serde(default)]
    pub issue_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
    #[serde(default)]
    pub merged_by: Option<RemoteUser>,
    #[serde(default)]
    pub assignee: Option<RemoteUser>,
}

impl RemoteItem {
    /// True for issue-listing entries that shadow a pull request.
    #[must_use]
    pub fn is_pull_shadow(&self) -> bool {
        self.pull_request.is_some()
    }

    /// The issue detail URL for this item, whichever payload shape it came from.
    #[must_use]
    pub fn effective_issue_url(&self) -> Option<String> {
        self.issue_url.clone().or_else(|| self.url.clone())
    }

    /// The labels collection URL.
    ///
    /// Issue payloads advertise a `{/name}`-templated `labels_url`; pull
    /// payloads don't advertise one at all, but the issue counterpart always
    /// serves it under `<issue_url>/labels`.
    #[must_use]
    pub fn effective_labels_url(&self) -> Option<String> {
        if let Some(templated) = &self.labels_url {
            let plain = match templated.find('{') {
                Some(idx) => &templated[..idx],
                None => templated.as_str(),
            };
            return Some(plain.to_string());
        }
        self.effective_issue_url().map(|u| format!("{u}/labels"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteComment {
    pub id: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLabel {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStatus {
    pub id: i64,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}
