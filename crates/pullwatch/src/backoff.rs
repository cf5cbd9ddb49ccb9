//! Per-URL failure backoff.
//!
//! Every URL that fails with a status of 400 or above is placed on a ledger
//! that suppresses further attempts until a computed future deadline. Each
//! subsequent failure extends the suppression by a fixed step, capped at one
//! hour. A single success wipes the entry: recovery is immediate and full,
//! not gradual.
//!
//! Keying is by exact URL, query string included, so individual pages of a
//! paginated endpoint are tracked independently and one broken sub-page does
//! not block its siblings.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Added to a URL's suppression window on every failure.
pub const BACKOFF_STEP: Duration = Duration::from_secs(120);

/// Upper bound on a single URL's suppression window.
pub const BACKOFF_CAP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct BackoffEntry {
    next_attempt_at: Instant,
    duration: Duration,
}

/// The per-URL backoff ledger.
///
/// Owned by the request layer behind a mutex; written from concurrent
/// request completions.
#[derive(Debug, Default)]
pub struct BackoffLedger {
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request to `url` may be attempted right now.
    ///
    /// Returns false while the URL's suppression window is still open;
    /// callers must then synthesize a failure without a network round trip.
    #[must_use]
    pub fn should_attempt(&self, url: &str) -> bool {
        match self.entries.get(url) {
            Some(entry) => Instant::now() >= entry.next_attempt_at,
            None => true,
        }
    }

    /// The deadline before which `url` will not be attempted, if any.
    #[must_use]
    pub fn next_attempt_at(&self, url: &str) -> Option<Instant> {
        self.entries.get(url).map(|e| e.next_attempt_at)
    }

    /// Record a failed response for `url`.
    ///
    /// Statuses below 400 leave the ledger untouched.
    pub fn record_failure(&mut self, url: &str, status: u16) {
        if status < 400 {
            return;
        }

        let now = Instant::now();
        match self.entries.get_mut(url) {
            Some(entry) => {
                if entry.duration < BACKOFF_CAP {
                    entry.duration = (entry.duration + BACKOFF_STEP).min(BACKOFF_CAP);
                }
                entry.next_attempt_at = now + entry.duration;
                tracing::debug!(
                    url,
                    seconds = entry.duration.as_secs(),
                    "extending backoff for throttled URL"
                );
            }
            None => {
                tracing::debug!(url, "placing URL on the throttled list");
                self.entries.insert(
                    url.to_string(),
                    BackoffEntry {
                        next_attempt_at: now + BACKOFF_STEP,
                        duration: BACKOFF_STEP,
                    },
                );
            }
        }
    }

    /// Record a successful response for `url`, clearing its entry entirely.
    pub fn record_success(&mut self, url: &str) {
        self.entries.remove(url);
    }

    /// Number of URLs currently suppressed or cooling down.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://api.example.com/repos/a/b/pulls?page=1&per_page=100";

    #[tokio::test(start_paused = true)]
    async fn unknown_url_is_always_eligible() {
        let ledger = BackoffLedger::new();
        assert!(ledger.should_attempt(URL));
        assert!(ledger.next_attempt_at(URL).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_suppresses_for_one_step() {
        let mut ledger = BackoffLedger::new();
        ledger.record_failure(URL, 500);
        assert!(!ledger.should_attempt(URL));

        tokio::time::advance(BACKOFF_STEP - Duration::from_secs(1)).await;
        assert!(!ledger.should_attempt(URL));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ledger.should_attempt(URL));
    }

    #[tokio::test(start_paused = true)]
    async fn next_attempt_is_monotonically_non_decreasing() {
        let mut ledger = BackoffLedger::new();
        let mut previous = None;
        for _ in 0..40 {
            ledger.record_failure(URL, 503);
            let next = ledger.next_attempt_at(URL).expect("entry exists");
            if let Some(prev) = previous {
                assert!(next >= prev, "deadline moved backwards");
            }
            previous = Some(next);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duration_never_exceeds_the_cap() {
        let mut ledger = BackoffLedger::new();
        // 40 failures at 120 s/step would be 80 minutes uncapped.
        for _ in 0..40 {
            ledger.record_failure(URL, 500);
        }
        let deadline = ledger.next_attempt_at(URL).expect("entry exists");
        assert!(deadline <= Instant::now() + BACKOFF_CAP);

        tokio::time::advance(BACKOFF_CAP).await;
        assert!(ledger.should_attempt(URL));
    }

    #[tokio::test(start_paused = true)]
    async fn single_success_fully_clears_after_many_failures() {
        let mut ledger = BackoffLedger::new();
        for _ in 0..10 {
            ledger.record_failure(URL, 500);
        }
        assert!(!ledger.should_attempt(URL));

        ledger.record_success(URL);
        assert!(ledger.should_attempt(URL));
        assert!(ledger.is_empty());

        // A new failure starts from the initial step again.
        ledger.record_failure(URL, 500);
        tokio::time::advance(BACKOFF_STEP).await;
        assert!(ledger.should_attempt(URL));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_400_statuses_do_not_touch_the_ledger() {
        let mut ledger = BackoffLedger::new();
        ledger.record_failure(URL, 304);
        ledger.record_failure(URL, 302);
        assert!(ledger.is_empty());
        assert!(ledger.should_attempt(URL));
    }

    #[tokio::test(start_paused = true)]
    async fn urls_are_tracked_independently() {
        let other = "https://api.example.com/repos/a/b/pulls?page=2&per_page=100";
        let mut ledger = BackoffLedger::new();
        ledger.record_failure(URL, 500);
        assert!(!ledger.should_attempt(URL));
        assert!(ledger.should_attempt(other));
        assert_eq!(ledger.len(), 1);
    }
}
