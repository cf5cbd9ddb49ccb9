//! Engine configuration.
//!
//! Settings are owned by the embedding application (the CLI maps its config
//! file onto this struct); the engine only reads them.

use std::str::FromStr;

use chrono::Duration;

/// What to do with an item that turns out to have been merged or closed.
///
/// The raw values are a persisted contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingPolicy {
    /// Keep the item, unless it is currently filed under the catch-all
    /// section.
    KeepMine,
    /// Keep the item unconditionally.
    KeepAll,
    /// Let the deletion stand.
    Discard,
}

impl HandlingPolicy {
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            HandlingPolicy::KeepMine => 0,
            HandlingPolicy::KeepAll => 1,
            HandlingPolicy::Discard => 2,
        }
    }

    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(HandlingPolicy::KeepMine),
            1 => Some(HandlingPolicy::KeepAll),
            2 => Some(HandlingPolicy::Discard),
            _ => None,
        }
    }
}

impl FromStr for HandlingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "keepmine" => Ok(HandlingPolicy::KeepMine),
            "keepall" => Ok(HandlingPolicy::KeepAll),
            "discard" => Ok(HandlingPolicy::Discard),
            _ => Err(format!("unknown handling policy: {s}")),
        }
    }
}

/// Tunables consulted during a sync cycle.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Policy for items discovered to have been merged.
    pub merge_handling: HandlingPolicy,
    /// Policy for items discovered to have been closed.
    pub close_handling: HandlingPolicy,
    /// Whether label collections are synced at all.
    pub show_labels: bool,
    /// Whether status collections are synced at all.
    pub show_statuses: bool,
    /// Cycles to skip between label refreshes of one item.
    pub label_refresh_interval: u32,
    /// Cycles to skip between status refreshes of one item.
    pub status_refresh_interval: u32,
    /// Repos untouched for longer than this are force-marked dirty.
    pub staleness_window: Duration,
    /// How often the watched-repository list itself is rediscovered.
    pub new_repo_check_period: Duration,
    /// Newly discovered repositories start out hidden.
    pub hide_new_repositories: bool,
    /// Discard items the authenticated user merged themselves, regardless of
    /// the merge handling policy.
    pub dont_keep_my_merges: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            merge_handling: HandlingPolicy::KeepMine,
            close_handling: HandlingPolicy::KeepMine,
            show_labels: false,
            show_statuses: false,
            label_refresh_interval: 4,
            status_refresh_interval: 10,
            staleness_window: Duration::hours(1),
            new_repo_check_period: Duration::hours(2),
            hide_new_repositories: false,
            dont_keep_my_merges: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_raw_mapping_is_stable() {
        assert_eq!(HandlingPolicy::KeepMine.as_raw(), 0);
        assert_eq!(HandlingPolicy::KeepAll.as_raw(), 1);
        assert_eq!(HandlingPolicy::Discard.as_raw(), 2);
        for raw in 0..3 {
            assert_eq!(HandlingPolicy::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert!(HandlingPolicy::from_raw(3).is_none());
    }

    #[test]
    fn policy_parses_common_spellings() {
        assert_eq!(
            "keep-mine".parse::<HandlingPolicy>().unwrap(),
            HandlingPolicy::KeepMine
        );
        assert_eq!(
            "keepAll".parse::<HandlingPolicy>().unwrap(),
            HandlingPolicy::KeepAll
        );
        assert_eq!(
            "discard".parse::<HandlingPolicy>().unwrap(),
            HandlingPolicy::Discard
        );
        assert!("keep".parse::<HandlingPolicy>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.merge_handling, HandlingPolicy::KeepMine);
        assert_eq!(settings.close_handling, HandlingPolicy::KeepMine);
        assert!(!settings.show_labels);
        assert!(!settings.show_statuses);
        assert_eq!(settings.label_refresh_interval, 4);
        assert_eq!(settings.status_refresh_interval, 10);
        assert_eq!(settings.staleness_window, Duration::hours(1));
        assert!(!settings.hide_new_repositories);
        assert!(!settings.dont_keep_my_merges);
    }
}
