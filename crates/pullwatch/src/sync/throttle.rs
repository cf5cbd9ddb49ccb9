//! Per-item refresh throttling for expensive child collections.
//!
//! Label and status sub-fetches are skipped on most cycles: each item keeps
//! a counter of cycles since its last refresh, and only becomes eligible
//! again once the counter reaches the configured interval. A newly observed
//! item has no counter and is always eligible.

use std::collections::HashMap;

/// The child collections subject to throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Labels,
    Statuses,
}

/// Counter value set when an item's collection was just refreshed.
const BASE_COUNT: u32 = 1;

/// Skip-most-cycles counters, keyed per item and per collection kind.
#[derive(Debug, Default)]
pub struct RefreshThrottle {
    counters: HashMap<(i64, ChildKind), u32>,
}

impl RefreshThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `item_id`'s collection should refresh this cycle.
    ///
    /// When the answer is no, the item's counter is advanced so that after
    /// `interval` further cycles it becomes eligible again.
    pub fn check(&mut self, item_id: i64, kind: ChildKind, interval: u32) -> bool {
        match self.counters.get_mut(&(item_id, kind)) {
            None => true,
            Some(count) if *count >= interval => true,
            Some(count) => {
                *count += 1;
                false
            }
        }
    }

    /// Record that the collection was just refreshed.
    pub fn mark_refreshed(&mut self, item_id: i64, kind: ChildKind) {
        self.counters.insert((item_id, kind), BASE_COUNT);
    }

    /// Evict every counter for a kind.
    ///
    /// Used when the corresponding feature is switched off, so a later
    /// re-enable starts from a clean re-check of every item.
    pub fn clear(&mut self, kind: ChildKind) {
        self.counters.retain(|(_, k), _| *k != kind);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
