use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

/// Instant of a recorded event.
pub type Timestamp = DateTime<Utc>;

/// Ordered record of event instants, answering "how many events happened in the last X?".
///
/// Events are appended at the back and expire from the front. Because instants are
/// never appended out of order, the expired entries always form a prefix:
///
/// ```text
///   now - window                                   now
///        |                                          |
///  [ e0  e1 | e2   e3      e4       e5   e6 ]       |
///   ^^^^^^^   ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^
///   expired   counted
/// ```
///
/// An event `e` is expired when `now - e >= window`. Eviction finds the boundary with
/// a binary search and drops the prefix; survivors keep their relative order.
///
/// The structure has no interior locking. It is owned by the admission gate and only
/// touched from inside its critical section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampWindow {
    events: VecDeque<Timestamp>,
}

impl TimestampWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from persisted instants.
    ///
    /// Persisted data is sorted first, so a hand-edited or reordered file still
    /// produces a monotonic sequence.
    pub fn from_events(mut events: Vec<Timestamp>) -> Self {
        events.sort_unstable();
        Self {
            events: events.into(),
        }
    }

    /// Append an event and return the instant actually stored.
    ///
    /// If the wall clock stepped backwards, `at` is clamped to the newest stored
    /// instant so the sequence stays non-decreasing.
    pub fn append(&mut self, at: Timestamp) -> Timestamp {
        let at = match self.events.back() {
            Some(&newest) if newest > at => newest,
            _ => at,
        };
        self.events.push_back(at);
        at
    }

    /// Drop every event with `now - event >= window`. Returns how many were removed.
    pub fn evict(&mut self, now: Timestamp, window: TimeDelta) -> usize {
        let expired = self
            .events
            .partition_point(|&event| now.signed_duration_since(event) >= window);
        self.events.drain(..expired);
        expired
    }

    /// Evict, append `now`, and count, as one step.
    ///
    /// The returned count includes the event just appended and excludes every
    /// event that expired at `now`.
    pub fn record(&mut self, now: Timestamp, window: TimeDelta) -> usize {
        self.evict(now, window);
        self.append(now);
        self.count()
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.events.front().copied()
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.events.back().copied()
    }

    /// Copy of the current sequence, oldest first. Snapshots are written from this
    /// copy, never from the live structure.
    pub fn snapshot(&self) -> Vec<Timestamp> {
        self.events.iter().copied().collect()
    }
}
