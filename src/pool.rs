use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a caller finds in its result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event was recorded; the window held this many events afterwards.
    Recorded(usize),
    /// The item was dropped without touching the window.
    Dropped,
    /// The item's deadline passed before it reached the window.
    Expired,
}

/// One in-flight "record an event" request.
///
/// Lifecycle: `created -> queued -> processing -> {completed | dropped}`, or
/// `queued -> dropped` when the caller gives up first. The result slot is a
/// single-use channel; [`WorkItem::complete`] takes it, so a second completion is
/// impossible.
///
/// The deadline travels with the item. Workers enforce it on their own timer, so
/// an expired item is dropped even if its caller is never polled again.
#[derive(Debug)]
pub struct WorkItem {
    submitted_at: Instant,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
    slot: Option<oneshot::Sender<Outcome>>,
}

impl WorkItem {
    fn blank() -> Self {
        Self {
            submitted_at: Instant::now(),
            deadline: None,
            cancel: None,
            slot: None,
        }
    }

    /// Stamp the item for a new request and return the receiving end of its slot.
    pub fn arm(
        &mut self,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.submitted_at = Instant::now();
        self.deadline = Some(deadline);
        self.cancel = Some(cancel);
        self.slot = Some(tx);
        rx
    }

    /// Fulfil the result slot. Returns `false` if it was already fulfilled.
    ///
    /// A caller that already went away simply never reads the outcome.
    pub fn complete(&mut self, outcome: Outcome) -> bool {
        match self.slot.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(true, CancellationToken::is_cancelled)
    }

    /// Resolves when the caller cancels. An unarmed item counts as cancelled.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => {}
        }
    }

    /// An unarmed item counts as expired.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .map_or(true, |deadline| Instant::now() >= deadline)
    }

    /// Resolves once the deadline is reached.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => {}
        }
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    fn clear(&mut self) {
        self.deadline = None;
        self.cancel = None;
        self.slot = None;
    }
}

/// Free-list of work items.
///
/// Ownership moves pool -> caller -> gate -> pool. The caller only ever keeps the
/// receiving half of the result slot, so an item can go back to the pool as soon as
/// its outcome is published.
#[derive(Debug)]
pub struct WorkItemPool {
    free: Mutex<Vec<WorkItem>>,
    max_idle: usize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl WorkItemPool {
    /// `max_idle` bounds how many released items are kept for reuse.
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self) -> WorkItem {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(item) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                WorkItem::blank()
            }
        }
    }

    /// Return an item. A still-pending slot is completed as dropped first, so no
    /// caller is left waiting on an item that went back to the pool.
    pub fn release(&self, mut item: WorkItem) {
        item.complete(Outcome::Dropped);
        item.clear();

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(item);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}
