use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CounterConfig;
use crate::error::{CounterError, OpenError, StoreError};
use crate::gate::{AdmissionGate, GateStats};
use crate::persist::SnapshotWriter;
use crate::store::SnapshotStore;

/// Counts requests received in a trailing window.
///
/// Every [`record_request`](Self::record_request) appends one event and returns how
/// many events fall inside the window, the new one included. Requests pass through
/// an [`AdmissionGate`] that caps how many are processed at once, and the window is
/// snapshotted to a [`SnapshotStore`] every `persist_interval` of event time so a
/// restart loses at most one interval of data.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use std::time::Duration;
/// use window_counter::{CounterConfig, JsonFileStore, SlidingCounter};
///
/// let store = Arc::new(JsonFileStore::new("data.json"));
/// let counter = SlidingCounter::open(CounterConfig::default(), store).await?;
///
/// let count = counter.record_request_within(Duration::from_secs(5)).await?;
/// println!("Requests in the last 60 seconds: {count}");
///
/// counter.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct SlidingCounter {
    gate: AdmissionGate,
    writer: SnapshotWriter,
    config: CounterConfig,
}

impl SlidingCounter {
    /// Load the persisted window from `store` and start admitting requests.
    ///
    /// A store that cannot be read is an error: starting empty could silently
    /// under-count a window that was persisted but is unreadable.
    pub async fn open(
        config: CounterConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, OpenError> {
        let settings = config.gate_settings()?;

        let loader = Arc::clone(&store);
        let events = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        info!(
            entries = events.len(),
            window_secs = config.window.as_secs_f64(),
            concurrency = config.concurrency,
            "Window hydrated"
        );

        let writer = SnapshotWriter::new(store);
        let gate = AdmissionGate::start(settings, events, writer.clone());
        Ok(Self {
            gate,
            writer,
            config,
        })
    }

    /// Record one event and report the window count, giving up at `deadline`.
    ///
    /// On `Timeout` the event is not recorded: a request that reaches its deadline
    /// before the critical section never mutates the window. The deadline is
    /// enforced by the worker as well, so this holds even when the calling task
    /// is not polled again until long after `deadline`.
    pub async fn record_request(&self, deadline: Instant) -> Result<usize, CounterError> {
        self.record_request_with(deadline, &CancellationToken::new())
            .await
    }

    pub async fn record_request_within(&self, timeout: Duration) -> Result<usize, CounterError> {
        self.record_request(Instant::now() + timeout).await
    }

    /// Like [`record_request`](Self::record_request), also giving up when `cancel` fires.
    pub async fn record_request_with(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<usize, CounterError> {
        if self.gate.is_closed() {
            return Err(CounterError::Closed);
        }

        let token = cancel.child_token();
        // Cancels the item on every way out of here, including this future being dropped.
        let _guard = token.clone().drop_guard();

        let mut item = self.gate.pool().acquire();
        let slot = item.arm(token, deadline);

        tokio::select! {
            biased;
            result = self.gate.submit(item, slot) => result,
            _ = tokio::time::sleep_until(deadline) => Err(CounterError::Timeout),
            _ = cancel.cancelled() => Err(CounterError::Cancelled),
        }
    }

    /// Events inside the window now, without recording a new one.
    pub fn current_count(&self) -> usize {
        self.gate.count()
    }

    /// Snapshot the window now, regardless of the persistence cadence.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.gate.flush().await
    }

    /// Stop accepting requests and wait up to `drain_timeout` for accepted ones.
    ///
    /// Returns `true` when everything drained in time.
    pub async fn close(&self) -> bool {
        self.gate.close(self.config.drain_timeout).await
    }

    /// Ordered shutdown: close, flush, wait for pending snapshot writes, close the store.
    ///
    /// The store is closed even when the final flush fails; the flush error is returned.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.close().await;

        let flushed = self.flush().await;
        if let Err(e) = &flushed {
            warn!(error = %e, "Final snapshot failed");
        }
        self.writer.wait_idle().await;

        let store = Arc::clone(self.writer.store());
        tokio::task::spawn_blocking(move || store.close())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        info!("Counter shut down");
        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    pub fn stats(&self) -> GateStats {
        self.gate.stats()
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }
}
