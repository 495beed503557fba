use chrono::TimeDelta;

use crate::window::Timestamp;

/// Decides when a recorded event should trigger a snapshot.
///
/// A snapshot is due when strictly more than `interval` has elapsed since the last
/// one, measured between event instants. The last-snapshot instant moves forward as
/// soon as a snapshot is triggered, before the write happens, and is never rolled
/// back when a write fails: the next snapshot carries the full sequence anyway.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    interval: TimeDelta,
    last_snapshot: Timestamp,
    triggered: u64,
}

impl SnapshotSchedule {
    /// `started_at` counts as the last snapshot, so the first event right after
    /// startup does not write the state that was just loaded.
    pub fn new(interval: TimeDelta, started_at: Timestamp) -> Self {
        Self {
            interval,
            last_snapshot: started_at,
            triggered: 0,
        }
    }

    /// Returns `true` when a snapshot must be taken for the event at `now`.
    pub fn poll(&mut self, now: Timestamp) -> bool {
        if now.signed_duration_since(self.last_snapshot) > self.interval {
            self.last_snapshot = now;
            self.triggered += 1;
            true
        } else {
            false
        }
    }

    pub fn last_snapshot(&self) -> Timestamp {
        self.last_snapshot
    }

    /// Number of snapshots triggered so far.
    pub fn triggered(&self) -> u64 {
        self.triggered
    }
}
