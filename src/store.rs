use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::StoreError;
use crate::window::Timestamp;

/// Durable home of the timestamp sequence.
///
/// `load` runs once at startup; `save` runs off the request path (on a blocking
/// thread) whenever a snapshot is due and on explicit flush; `close` runs once at
/// shutdown after the final save. Every save replaces the previous contents.
pub trait SnapshotStore: Send + Sync {
    /// Returns an empty sequence, not an error, when nothing was persisted yet.
    fn load(&self) -> Result<Vec<Timestamp>, StoreError>;

    /// Saving an empty sequence is a no-op.
    fn save(&self, events: &[Timestamp]) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

/// Stores the sequence as a JSON array of RFC 3339 instants.
///
/// Writes go to a sibling `.tmp` file which is fsynced and then renamed over the
/// target, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    closed: AtomicBool,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Timestamp>, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot found, starting empty");
                return Ok(Vec::new());
            }
            // Anything else may hide a snapshot we cannot read.
            Err(e) => return Err(StoreError::Io(e)),
        };
        if data.trim().is_empty() {
            info!(path = %self.path.display(), "Snapshot file is empty, starting empty");
            return Ok(Vec::new());
        }

        let events: Vec<Timestamp> =
            serde_json::from_str(&data).map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), entries = events.len(), "Snapshot loaded");
        Ok(events)
    }

    fn save(&self, events: &[Timestamp]) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if events.is_empty() {
            return Ok(());
        }

        let data = serde_json::to_vec(events).map_err(StoreError::Encode)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.tmp_path();
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), entries = events.len(), "Snapshot saved");
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "Snapshot store closed");
        Ok(())
    }
}

/// In-process store. Keeps the last saved sequence and counts saves.
///
/// Useful for embedding without a disk and for observing snapshot behaviour in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<Vec<Timestamp>>,
    saves: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already holds a previous snapshot.
    pub fn with_events(events: Vec<Timestamp>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of successful non-empty saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    pub fn saved(&self) -> Vec<Timestamp> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Vec<Timestamp>, StoreError> {
        Ok(self.saved())
    }

    fn save(&self, events: &[Timestamp]) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory store set to fail",
            )));
        }
        if events.is_empty() {
            return Ok(());
        }

        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = events.to_vec();
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
