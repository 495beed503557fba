use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{CounterError, StoreError};
use crate::persist::SnapshotWriter;
use crate::pool::{Outcome, WorkItem, WorkItemPool};
use crate::schedule::SnapshotSchedule;
use crate::window::{Timestamp, TimestampWindow};

/// Knobs of the admission gate.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub window: TimeDelta,
    pub persist_interval: TimeDelta,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub processing_delay: Duration,
}

/// Point-in-time counters of the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Accepted items not yet picked up by the dispatcher.
    pub queued: usize,
    /// Workers currently holding a permit.
    pub in_flight: usize,
    /// Highest `in_flight` ever observed.
    pub max_in_flight: usize,
    pub recorded: u64,
    pub dropped: u64,
    pub snapshots_triggered: u64,
    pub snapshots_saved: u64,
    pub snapshots_failed: u64,
}

/// The window and its snapshot cadence. Only reachable through [`Shared::ledger`].
struct Ledger {
    window: TimestampWindow,
    schedule: SnapshotSchedule,
}

struct Shared {
    ledger: Mutex<Ledger>,
    span: TimeDelta,
    processing_delay: Duration,
    permits: Arc<Semaphore>,
    pool: WorkItemPool,
    writer: SnapshotWriter,
    abort: CancellationToken,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drop_item(&self, mut item: WorkItem, stage: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let expired = !self.abort.is_cancelled() && item.is_expired();
        debug!(
            stage,
            expired,
            waited_ms = item.age().as_millis() as u64,
            "Request dropped before recording"
        );
        item.complete(if expired { Outcome::Expired } else { Outcome::Dropped });
        self.pool.release(item);
    }

    /// Worker body. The permit is held until this returns, whatever the exit path.
    async fn process(self: Arc<Self>, mut item: WorkItem, _permit: OwnedSemaphorePermit) {
        let _in_flight = InFlight::enter(&self);

        if !self.processing_delay.is_zero() {
            let proceed = tokio::select! {
                biased;
                _ = item.cancelled() => false,
                _ = item.expired() => false,
                _ = self.abort.cancelled() => false,
                _ = tokio::time::sleep(self.processing_delay) => true,
            };
            if !proceed {
                self.drop_item(item, "processing");
                return;
            }
        }

        let snapshot = {
            let mut ledger = self.ledger();
            // Checked under the lock: a cancelled or expired item never touches the window.
            if item.is_cancelled() || item.is_expired() || self.abort.is_cancelled() {
                drop(ledger);
                self.drop_item(item, "critical-section");
                return;
            }

            let now = Utc::now();
            let count = ledger.window.record(now, self.span);
            let snapshot = ledger
                .schedule
                .poll(now)
                .then(|| (self.writer.next_generation(), ledger.window.snapshot()));
            drop(ledger);

            item.complete(Outcome::Recorded(count));
            self.recorded.fetch_add(1, Ordering::Relaxed);
            debug!(count, latency_us = item.age().as_micros() as u64, "Request recorded");
            snapshot
        };

        if let Some((generation, events)) = snapshot {
            self.writer.spawn(generation, events);
        }
        self.pool.release(item);
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::AcqRel);
        Self(&shared.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded-concurrency dispatcher in front of the window.
///
/// Callers push work items into a bounded queue; a single dispatch loop pulls them
/// off and starts a worker for each, holding one of `concurrency` permits. A full
/// queue makes [`AdmissionGate::submit`] wait, which is how slow processing turns
/// into caller latency instead of lost events.
///
/// Once an item is in the queue it is completed exactly once: recorded, or dropped
/// because its caller cancelled, its deadline passed or closing ran out of time.
pub struct AdmissionGate {
    shared: Arc<Shared>,
    tx: mpsc::Sender<WorkItem>,
    closing: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: TaskTracker,
}

impl AdmissionGate {
    /// Start the dispatch loop over a window hydrated with `events`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(settings: GateSettings, events: Vec<Timestamp>, writer: SnapshotWriter) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let shared = Arc::new(Shared {
            ledger: Mutex::new(Ledger {
                window: TimestampWindow::from_events(events),
                schedule: SnapshotSchedule::new(settings.persist_interval, Utc::now()),
            }),
            span: settings.window,
            processing_delay: settings.processing_delay,
            permits: Arc::new(Semaphore::new(settings.concurrency)),
            pool: WorkItemPool::new(settings.queue_capacity + settings.concurrency),
            writer,
            abort: CancellationToken::new(),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let closing = CancellationToken::new();
        let workers = TaskTracker::new();
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&shared),
            rx,
            closing.clone(),
            workers.clone(),
        ));

        Self {
            shared,
            tx,
            closing,
            dispatcher: Mutex::new(Some(dispatcher)),
            workers,
        }
    }

    pub fn pool(&self) -> &WorkItemPool {
        &self.shared.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Queue an armed item and wait for its outcome.
    ///
    /// Waits for queue space when the queue is full. Deadlines are the caller's
    /// business: dropping this future before it resolves is how a caller gives up,
    /// and cancelling the item's token makes sure it is never recorded.
    pub async fn submit(
        &self,
        item: WorkItem,
        slot: oneshot::Receiver<Outcome>,
    ) -> Result<usize, CounterError> {
        if self.closing.is_cancelled() {
            self.shared.pool.release(item);
            return Err(CounterError::Closed);
        }

        let reserved = tokio::select! {
            biased;
            _ = self.closing.cancelled() => None,
            permit = self.tx.reserve() => permit.ok(),
        };
        let Some(permit) = reserved else {
            self.shared.pool.release(item);
            return Err(CounterError::Closed);
        };
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        permit.send(item);

        match slot.await {
            Ok(Outcome::Recorded(count)) => Ok(count),
            Ok(Outcome::Expired) => Err(CounterError::Timeout),
            Ok(Outcome::Dropped) | Err(_) if self.shared.abort.is_cancelled() => {
                Err(CounterError::Closed)
            }
            Ok(Outcome::Dropped) | Err(_) => Err(CounterError::Cancelled),
        }
    }

    /// Count of events inside the window right now, without recording one.
    pub fn count(&self) -> usize {
        let mut ledger = self.shared.ledger();
        ledger.window.evict(Utc::now(), self.shared.span);
        ledger.window.count()
    }

    /// Snapshot the current sequence immediately and wait for the write.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (generation, events) = {
            let mut ledger = self.shared.ledger();
            ledger.window.evict(Utc::now(), self.shared.span);
            (self.shared.writer.next_generation(), ledger.window.snapshot())
        };
        self.shared.writer.write(generation, events).await?;
        info!("Snapshot flushed");
        Ok(())
    }

    /// Stop admitting, then let queued and in-flight items finish.
    ///
    /// Items still unfinished after `grace` are dropped without being recorded.
    /// Returns `true` when everything drained within `grace`.
    pub async fn close(&self, grace: Duration) -> bool {
        self.closing.cancel();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut dispatcher) = dispatcher else {
            self.workers.wait().await;
            return true;
        };
        info!(
            queued = self.shared.queued.load(Ordering::Acquire),
            in_flight = self.shared.in_flight.load(Ordering::Acquire),
            "Admission gate closing"
        );

        let drained = tokio::time::timeout(grace, async {
            let _ = (&mut dispatcher).await;
            self.workers.wait().await;
        })
        .await
        .is_ok();

        if drained {
            info!("Admission gate drained");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                in_flight = self.shared.in_flight.load(Ordering::Acquire),
                "Drain timeout reached, dropping unfinished requests"
            );
            self.shared.abort.cancel();
            let _ = dispatcher.await;
            self.workers.wait().await;
        }
        drained
    }

    pub fn stats(&self) -> GateStats {
        let shared = &self.shared;
        GateStats {
            queued: shared.queued.load(Ordering::Acquire),
            in_flight: shared.in_flight.load(Ordering::Acquire),
            max_in_flight: shared.max_in_flight.load(Ordering::Acquire),
            recorded: shared.recorded.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            snapshots_triggered: shared.ledger().schedule.triggered(),
            snapshots_saved: shared.writer.saved(),
            snapshots_failed: shared.writer.failed(),
        }
    }

}

impl Drop for AdmissionGate {
    fn drop(&mut self) {
        self.closing.cancel();
        self.shared.abort.cancel();
    }
}

/// Dispatch loop: one item at a time, one permit per worker.
async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<WorkItem>,
    closing: CancellationToken,
    workers: TaskTracker,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else { break };
        admit(&shared, item, &workers).await;
    }

    // Nothing new gets in; whatever was already accepted still gets an outcome.
    rx.close();
    while let Some(item) = rx.recv().await {
        admit(&shared, item, &workers).await;
    }
    workers.close();
    debug!("Dispatch loop stopped");
}

async fn admit(shared: &Arc<Shared>, item: WorkItem, workers: &TaskTracker) {
    shared.queued.fetch_sub(1, Ordering::AcqRel);
    if item.is_cancelled() || item.is_expired() {
        shared.drop_item(item, "queued");
        return;
    }

    let permit = tokio::select! {
        biased;
        _ = item.cancelled() => None,
        _ = item.expired() => None,
        permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
    };
    let Some(permit) = permit else {
        shared.drop_item(item, "awaiting-permit");
        return;
    };

    workers.spawn(Arc::clone(shared).process(item, permit));
}
