pub mod event;
pub mod session;

use std::path::Path;
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use event::WatchEvent;
use session::{Admission, FileFilter, WatchSession};

/// Admitted events waiting for the coordinator. At most one is admitted per
/// arm cycle, so this only needs room for a few.
const ADMITTED_BUFFER: usize = 4;

/// Handle to a running watcher. Keeps the OS watcher alive (dropping stops watching).
pub struct WatcherHandle {
    /// Keep alive: dropping the watcher stops OS notifications and ends the bridge.
    _watcher: notify::RecommendedWatcher,
    /// The bridge task forwarding admitted events from the std channel to tokio.
    _bridge_task: JoinHandle<()>,
}

/// Start watching `session.directory()` for new files.
///
/// Returns a `WatcherHandle` (must be kept alive) and a tokio mpsc receiver
/// that yields only the events the session admitted.
///
/// The watcher:
/// - Watches the directory non-recursively
/// - Classifies creations and renames-into-the-directory as `Created`
/// - Skips directories and files the session's filter rejects
/// - Passes each candidate through `WatchSession::admit`; events arriving
///   while disarmed are recorded as missed and not forwarded
pub fn start_watcher(
    session: Arc<WatchSession>,
) -> anyhow::Result<(WatcherHandle, tokio_mpsc::Receiver<WatchEvent>)> {
    let (std_tx, std_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = std_tx.send(res);
    })?;
    watcher.watch(session.directory(), RecursiveMode::NonRecursive)?;

    let (tokio_tx, tokio_rx) = tokio_mpsc::channel::<WatchEvent>(ADMITTED_BUFFER);

    // Bridge: spawn_blocking to receive from std channel, classify, gate, forward to tokio
    let bridge_task = tokio::task::spawn_blocking(move || {
        while let Ok(result) = std_rx.recv() {
            match result {
                Ok(event) => {
                    for watch_event in classify_event(&event, session.filter()) {
                        if session.admit(watch_event.path()) == Admission::Dropped {
                            continue;
                        }
                        debug!(path = %watch_event.path().display(), "new file admitted");
                        if tokio_tx.blocking_send(watch_event).is_err() {
                            return; // receiver dropped, shutdown
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "watcher error");
                }
            }
        }
    });

    Ok((
        WatcherHandle {
            _watcher: watcher,
            _bridge_task: bridge_task,
        },
        tokio_rx,
    ))
}

/// Classify a raw notification into `Created` events, or nothing if it should be ignored.
///
/// Filtering order:
/// 1. Event kind: file creation, or a rename whose destination is this directory
/// 2. The path must still exist and be a regular file
/// 3. The session's extension filter
pub fn classify_event(event: &notify::Event, filter: &FileFilter) -> Vec<WatchEvent> {
    let candidates: &[std::path::PathBuf] = match event.kind {
        EventKind::Create(CreateKind::Folder) => &[],
        EventKind::Create(_) => &event.paths,
        // `Both` repeats a rename already reported as `To` on platforms that send both.
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => &event.paths,
        _ => &[],
    };

    candidates
        .iter()
        .filter(|path| is_new_file(path, filter))
        .map(|path| WatchEvent::Created(path.clone()))
        .collect()
}

fn is_new_file(path: &Path, filter: &FileFilter) -> bool {
    path.is_file() && filter.matches(path)
}
