use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::SnapshotStore;
use crate::window::Timestamp;

/// Hands snapshot copies to the store on blocking threads.
///
/// Every snapshot gets a generation number when it is taken. Writes are serialized,
/// and a write whose generation is not newer than the last one attempted is skipped,
/// so a slow old snapshot can never overwrite a newer one.
#[derive(Clone)]
pub struct SnapshotWriter {
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

struct Shared {
    store: Arc<dyn SnapshotStore>,
    next_generation: AtomicU64,
    last_attempted: Mutex<u64>,
    saved: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn write(&self, generation: u64, events: &[Timestamp]) -> Result<(), StoreError> {
        let mut last = self
            .last_attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if generation <= *last {
            debug!(generation, last = *last, "Snapshot superseded, skipping");
            return Ok(());
        }
        *last = generation;

        match self.store.save(events) {
            Ok(()) => {
                self.saved.fetch_add(1, Ordering::Relaxed);
                debug!(generation, entries = events.len(), "Snapshot written");
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(generation, entries = events.len(), error = %e, "Snapshot write failed");
                Err(e)
            }
        }
    }
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                next_generation: AtomicU64::new(1),
                last_attempted: Mutex::new(0),
                saved: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Reserve the generation for a snapshot being taken now.
    ///
    /// Must be called while the sequence is still locked, so generation order
    /// matches the order in which snapshots were copied.
    pub fn next_generation(&self) -> u64 {
        self.shared.next_generation.fetch_add(1, Ordering::AcqRel)
    }

    /// Write in the background. Failures are logged and counted, never returned.
    pub fn spawn(&self, generation: u64, events: Vec<Timestamp>) {
        let shared = Arc::clone(&self.shared);
        self.tracker.spawn_blocking(move || {
            let _ = shared.write(generation, &events);
        });
    }

    /// Write and wait for the result.
    pub async fn write(&self, generation: u64, events: Vec<Timestamp>) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        self.tracker
            .spawn_blocking(move || shared.write(generation, &events))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Wait for every background write spawned so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn saved(&self) -> u64 {
        self.shared.saved.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.shared.store
    }
}
