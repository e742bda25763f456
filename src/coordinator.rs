//! The detect → stabilize → upload → re-arm cycle.
//!
//! The coordinator owns the [`WatchSession`] for the lifetime of the service.
//! An admitted creation event has already disarmed the session; the
//! coordinator walks that one file through probing and uploading and re-arms
//! the session once the file reaches a terminal outcome, whatever it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ProbeError, UploadError};
use crate::probe::FileStabilityProbe;
use crate::upload::UploadOrchestrator;
use crate::upload::progress::UploadProgressEvent;
use crate::watcher::event::WatchEvent;
use crate::watcher::session::WatchSession;

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Watching; no upload pending.
    Armed,
    /// A new file was admitted and the watch is disarmed.
    Detected,
    /// Waiting for the writer to release the file.
    WaitingForStable,
    Uploading,
    /// The watch is no longer delivering events (shutdown or watcher loss).
    DisarmedError,
}

impl CoordinatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Armed => "armed",
            Self::Detected => "detected",
            Self::WaitingForStable => "waiting_for_stable",
            Self::Uploading => "uploading",
            Self::DisarmedError => "disarmed",
        }
    }
}

/// The single file currently moving through the pipeline.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub path: PathBuf,
    pub detected_at: DateTime<Local>,
    pub probe_attempts: u32,
    pub upload_attempts: u32,
    pub phase: CoordinatorState,
}

/// How one PendingUpload ended.
#[derive(Debug)]
pub enum Outcome {
    Uploaded { video_id: String },
    /// The file was never uploaded because probing failed.
    Skipped(ProbeError),
    Failed(UploadError),
}

/// Extra attempts for uploads that failed in a retryable way.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

pub struct WatchCoordinator {
    session: Arc<WatchSession>,
    probe: FileStabilityProbe,
    orchestrator: UploadOrchestrator,
    retry: RetryPolicy,
    pending: Option<PendingUpload>,
    handled: u64,
    state_tx: watch::Sender<CoordinatorState>,
}

impl WatchCoordinator {
    pub fn new(
        session: Arc<WatchSession>,
        probe: FileStabilityProbe,
        orchestrator: UploadOrchestrator,
        retry: RetryPolicy,
    ) -> Self {
        let initial = if session.is_armed() {
            CoordinatorState::Armed
        } else {
            CoordinatorState::DisarmedError
        };
        let (state_tx, _) = watch::channel(initial);
        Self {
            session,
            probe,
            orchestrator,
            retry,
            pending: None,
            handled: 0,
            state_tx,
        }
    }

    pub fn session(&self) -> &Arc<WatchSession> {
        &self.session
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    pub fn pending(&self) -> Option<&PendingUpload> {
        self.pending.as_ref()
    }

    /// Files taken through [`handle`](Self::handle), whatever their outcome.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Process admitted events until `cancel` fires or the event source closes.
    ///
    /// Leaves the session disarmed and the coordinator in `DisarmedError`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        info!(directory = %self.session.directory().display(), "watching for new recordings");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(WatchEvent::Created(path)) => {
                    self.handle(&path, &cancel).await;
                }
                None => {
                    warn!("watch event source closed");
                    break;
                }
            }
        }

        self.session.disarm();
        self.transition(CoordinatorState::DisarmedError);
        info!(
            handled = self.handled,
            missed = self.session.missed_total(),
            "stopped watching for new recordings"
        );
        self
    }

    /// Take one admitted file through the pipeline and re-arm the watch.
    pub async fn handle(&mut self, path: &Path, cancel: &CancellationToken) -> Outcome {
        let detected_at = Local::now();
        self.handled += 1;
        self.pending = Some(PendingUpload {
            path: path.to_path_buf(),
            detected_at,
            probe_attempts: 0,
            upload_attempts: 0,
            phase: CoordinatorState::Detected,
        });
        self.session.disarm();
        self.transition(CoordinatorState::Detected);
        info!(path = %path.display(), "new recording detected");

        let outcome = self.process(path, detected_at, cancel).await;

        match &outcome {
            Outcome::Skipped(ProbeError::Cancelled) | Outcome::Failed(UploadError::Cancelled) => {
                info!(path = %path.display(), "abandoned file on shutdown");
            }
            Outcome::Uploaded { video_id } => {
                info!(path = %path.display(), video_id = %video_id, "upload complete");
            }
            Outcome::Skipped(err) => {
                warn!(path = %path.display(), phase = "waiting_for_stable", error = %err, "skipping file");
            }
            Outcome::Failed(err) => {
                error!(path = %path.display(), phase = "uploading", error = %err, "upload failed");
            }
        }

        self.pending = None;
        self.session.rearm();
        self.transition(CoordinatorState::Armed);
        outcome
    }

    async fn process(
        &mut self,
        path: &Path,
        detected_at: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Outcome {
        self.transition(CoordinatorState::WaitingForStable);
        match self.probe.wait_until_stable(path, cancel).await {
            Ok(ready) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.probe_attempts = ready.attempts;
                }
                info!(
                    path = %path.display(),
                    attempts = ready.attempts,
                    waited_ms = ready.waited.as_millis() as u64,
                    "recording finished"
                );
            }
            Err(err) => return Outcome::Skipped(err),
        }

        self.transition(CoordinatorState::Uploading);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(pending) = self.pending.as_mut() {
                pending.upload_attempts = attempt;
            }

            let error = match self.upload_once(path, detected_at, cancel).await {
                Ok(video_id) => return Outcome::Uploaded { video_id },
                Err(error) => error,
            };

            if attempt > self.retry.max_retries || !error.is_retryable() {
                return Outcome::Failed(error);
            }

            warn!(
                path = %path.display(),
                attempt,
                error = %error,
                backoff_ms = self.retry.backoff.as_millis() as u64,
                "upload failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Failed(UploadError::Cancelled),
                _ = tokio::time::sleep(self.retry.backoff) => {}
            }
        }
    }

    /// Consume one upload stream to its terminal event.
    async fn upload_once(
        &self,
        path: &Path,
        detected_at: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let mut stream = self
            .orchestrator
            .upload(path, detected_at, cancel.child_token());

        while let Some(event) = stream.next().await {
            match event {
                UploadProgressEvent::Uploading {
                    bytes_sent,
                    total_bytes,
                } => {
                    debug!(path = %path.display(), bytes_sent, total_bytes, "bytes sent");
                }
                UploadProgressEvent::Completed { video_id } => return Ok(video_id),
                UploadProgressEvent::Failed { error } => return Err(error),
            }
        }

        Err(UploadError::TransportFailure(
            "upload ended without a terminal event".to_string(),
        ))
    }

    fn transition(&mut self, next: CoordinatorState) {
        if let Some(pending) = self.pending.as_mut() {
            pending.phase = next;
        }
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "state transition");
        }
    }
}
