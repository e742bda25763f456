//! The armed/disarmed gate in front of the coordinator.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Local};
use tracing::warn;

/// How many dropped detections are remembered for inspection.
pub const MISSED_HISTORY: usize = 64;

/// Which new files the session reacts to.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// Lowercase extensions without the dot. Empty accepts everything.
    extensions: Vec<String>,
}

impl FileFilter {
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}

/// A creation event that arrived while an upload was in flight.
#[derive(Debug, Clone)]
pub struct MissedDetection {
    pub path: PathBuf,
    pub at: DateTime<Local>,
}

/// Result of offering a creation event to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The session was armed and is now disarmed on behalf of this event.
    Admitted,
    /// The session was already disarmed; the event is lost.
    Dropped,
}

/// One directory subscription and its arm/disarm state.
///
/// Armed exactly when no upload is pending. Admission is a single
/// compare-and-swap, so two simultaneous creation events can never both
/// get through.
#[derive(Debug)]
pub struct WatchSession {
    directory: PathBuf,
    filter: FileFilter,
    armed: AtomicBool,
    missed_total: AtomicU64,
    missed: Mutex<VecDeque<MissedDetection>>,
}

impl WatchSession {
    /// New sessions start armed.
    pub fn new(directory: impl Into<PathBuf>, filter: FileFilter) -> Self {
        Self {
            directory: directory.into(),
            filter,
            armed: AtomicBool::new(true),
            missed_total: AtomicU64::new(0),
            missed: Mutex::new(VecDeque::with_capacity(MISSED_HISTORY)),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn filter(&self) -> &FileFilter {
        &self.filter
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Offer a creation event. The first event while armed disarms the
    /// session and is admitted; anything arriving while disarmed is recorded
    /// as missed and never replayed.
    pub fn admit(&self, path: &Path) -> Admission {
        if self
            .armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Admission::Admitted;
        }

        self.record_missed(path);
        Admission::Dropped
    }

    pub fn rearm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn missed_total(&self) -> u64 {
        self.missed_total.load(Ordering::Relaxed)
    }

    /// Most recent dropped detections, oldest first.
    pub fn missed(&self) -> Vec<MissedDetection> {
        match self.missed.lock() {
            Ok(missed) => missed.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn record_missed(&self, path: &Path) {
        let total = self.missed_total.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            path = %path.display(),
            missed_total = total,
            "file appeared while an upload was in flight; it will not be uploaded"
        );

        let entry = MissedDetection {
            path: path.to_path_buf(),
            at: Local::now(),
        };
        let mut missed = match self.missed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if missed.len() == MISSED_HISTORY {
            missed.pop_front();
        }
        missed.push_back(entry);
    }
}
