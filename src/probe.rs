//! Decide whether a newly-created file is still being written.
//!
//! A recording process keeps its output open for writing until it finishes.
//! The probe repeatedly checks for such a writer; the first clean check means
//! the producer has let go and the file is safe to upload.
//!
//! Writer detection depends on the platform:
//!
//! - Windows opens the file with no sharing, which fails while any handle is open.
//! - Linux scans the open descriptors of every visible process under `/proc`
//!   for a write handle on the file.
//! - Other Unix systems treat the file as written until its size and
//!   modification time stay unchanged across one probe interval.
//!
//! On Unix an exclusive advisory lock held by the producer also counts as a writer.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProbeError;

/// Windows `ERROR_SHARING_VIOLATION` / `ERROR_LOCK_VIOLATION`.
const WINDOWS_SHARING_ERRORS: [i32; 2] = [32, 33];

/// One non-blocking attempt at exclusive access to a file.
pub trait ExclusiveAccess: Send + Sync {
    /// Succeeds only when no other process holds the file open for writing.
    /// Contention is reported as [`io::ErrorKind::WouldBlock`] or the
    /// platform's lock/sharing error. Any handle is released before returning.
    fn try_exclusive(&self, path: &Path) -> io::Result<()>;
}

/// Exclusive access through the operating system.
#[derive(Debug, Default)]
pub struct OsExclusiveAccess {
    #[cfg(all(not(windows), not(target_os = "linux")))]
    quiescence: QuiescentFile,
}

impl ExclusiveAccess for OsExclusiveAccess {
    #[cfg(windows)]
    fn try_exclusive(&self, path: &Path) -> io::Result<()> {
        use std::os::windows::fs::OpenOptionsExt;

        let _file = std::fs::OpenOptions::new()
            .read(true)
            .share_mode(0)
            .open(path)?;
        Ok(())
    }

    #[cfg(not(windows))]
    fn try_exclusive(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::open(path)?;
        fs2::FileExt::try_lock_exclusive(&file)?;
        fs2::FileExt::unlock(&file)?;
        drop(file);
        self.no_writers(path)
    }
}

impl OsExclusiveAccess {
    #[cfg(target_os = "linux")]
    fn no_writers(&self, path: &Path) -> io::Result<()> {
        if has_open_writer(path)? {
            Err(still_written())
        } else {
            Ok(())
        }
    }

    #[cfg(all(not(windows), not(target_os = "linux")))]
    fn no_writers(&self, path: &Path) -> io::Result<()> {
        self.quiescence.try_exclusive(path)
    }
}

/// Whether any process this user can inspect has `path` open for writing.
///
/// Processes owned by other users are skipped: their descriptor tables are
/// unreadable without privileges.
#[cfg(target_os = "linux")]
fn has_open_writer(path: &Path) -> io::Result<bool> {
    use procfs::process::{FDPermissions, FDTarget};

    let target = std::fs::canonicalize(path)?;
    let processes = procfs::process::all_processes().map_err(io::Error::other)?;

    for process in processes.flatten() {
        let Ok(fds) = process.fd() else {
            continue;
        };
        for fd in fds.flatten() {
            let FDTarget::Path(open) = &fd.target else {
                continue;
            };
            if open == &target && fd.mode().contains(FDPermissions::WRITE) {
                debug!(pid = process.pid, fd = fd.fd, path = %path.display(), "file has an open writer");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn still_written() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    len: u64,
    modified: Option<SystemTime>,
}

/// Treats a file as written until its size and modification time are the
/// same on two consecutive checks.
///
/// The first check of a path always reports contention, so a finished file
/// needs one extra probe interval.
#[derive(Debug, Default)]
pub struct QuiescentFile {
    last_seen: Mutex<HashMap<PathBuf, Snapshot>>,
}

impl ExclusiveAccess for QuiescentFile {
    fn try_exclusive(&self, path: &Path) -> io::Result<()> {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                last_seen.remove(path);
                return Err(err);
            }
        };
        let seen = Snapshot {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        };

        match last_seen.insert(path.to_path_buf(), seen) {
            Some(previous) if previous == seen => {
                last_seen.remove(path);
                Ok(())
            }
            _ => Err(still_written()),
        }
    }
}

/// Whether `err` means "someone else still holds the file" rather than a real fault.
fn is_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    let Some(code) = err.raw_os_error() else {
        return false;
    };
    if Some(code) == fs2::lock_contended_error().raw_os_error() {
        return true;
    }
    cfg!(windows) && WINDOWS_SHARING_ERRORS.contains(&code)
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// Sleep between failed attempts.
    pub interval: Duration,
    /// Attempts before giving up with [`ProbeError::Timeout`].
    pub max_attempts: u32,
}

/// Successful probe: the file is no longer held by a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Number of access attempts, including the successful one.
    pub attempts: u32,
    /// Time spent waiting between attempts.
    pub waited: Duration,
}

#[derive(Clone)]
pub struct FileStabilityProbe {
    access: Arc<dyn ExclusiveAccess>,
    settings: ProbeSettings,
}

impl FileStabilityProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        Self::with_access(Arc::new(OsExclusiveAccess::default()), settings)
    }

    pub fn with_access(access: Arc<dyn ExclusiveAccess>, settings: ProbeSettings) -> Self {
        Self { access, settings }
    }

    pub fn settings(&self) -> ProbeSettings {
        self.settings
    }

    /// Poll `path` until exclusive access succeeds.
    ///
    /// The first attempt happens immediately, so an already-finished file is
    /// `Ready` with no delay. Each later attempt waits `interval`; after
    /// `max_attempts` failures the probe returns `Timeout`.
    pub async fn wait_until_stable(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Ready, ProbeError> {
        let started = Instant::now();
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }

            match self.attempt(path).await {
                Ok(()) => {
                    debug!(path = %path.display(), attempt, "file is no longer being written");
                    return Ok(Ready {
                        attempts: attempt,
                        waited: started.elapsed(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(ProbeError::NotFound(path.to_path_buf()));
                }
                Err(err) if is_contention(&err) => {
                    debug!(path = %path.display(), attempt, "file is still being written");
                }
                Err(source) => {
                    return Err(ProbeError::IoFault {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }

            if attempt == max_attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        Err(ProbeError::Timeout {
            path: path.to_path_buf(),
            attempts: max_attempts,
        })
    }

    /// Run one access attempt off the async executor.
    async fn attempt(&self, path: &Path) -> io::Result<()> {
        let access = Arc::clone(&self.access);
        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || access.try_exclusive(&owned))
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports the file as locked for the first `locked_for` attempts.
    struct LockedFor {
        locked_for: u32,
        calls: AtomicU32,
    }

    impl LockedFor {
        fn new(locked_for: u32) -> Arc<Self> {
            Arc::new(Self {
                locked_for,
                calls: AtomicU32::new(0),
            })
        }
    }

    impl ExclusiveAccess for LockedFor {
        fn try_exclusive(&self, _path: &Path) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.locked_for {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(())
            }
        }
    }

    struct Failing(io::ErrorKind);

    impl ExclusiveAccess for Failing {
        fn try_exclusive(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::from(self.0))
        }
    }

    fn settings(max_attempts: u32) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(2),
            max_attempts,
        }
    }

    fn fast_settings(max_attempts: u32) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(10),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_file_is_ready_on_first_attempt_without_waiting() {
        let access = LockedFor::new(0);
        let probe = FileStabilityProbe::with_access(access.clone(), settings(5));

        let ready = probe
            .wait_until_stable(Path::new("clip.mp4"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ready.attempts, 1);
        assert_eq!(ready.waited, Duration::ZERO);
        assert_eq!(access.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_for_three_intervals_takes_four_attempts() {
        let access = LockedFor::new(3);
        let probe = FileStabilityProbe::with_access(access, settings(10));

        let ready = probe
            .wait_until_stable(Path::new("clip.mp4"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ready.attempts, 4);
        assert_eq!(ready.waited.as_secs(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_released_file_times_out_at_ceiling() {
        let access = LockedFor::new(u32::MAX);
        let probe = FileStabilityProbe::with_access(access.clone(), settings(3));

        let err = probe
            .wait_until_stable(Path::new("clip.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Timeout { attempts: 3, .. }));
        assert_eq!(access.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_waiting_probe() {
        let probe = FileStabilityProbe::with_access(LockedFor::new(u32::MAX), settings(1_000));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let err = probe
            .wait_until_stable(Path::new("clip.mp4"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let probe = FileStabilityProbe::new(settings(3));

        let err = probe
            .wait_until_stable(&dir.path().join("gone.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_other_io_errors_are_surfaced() {
        let probe = FileStabilityProbe::with_access(
            Arc::new(Failing(io::ErrorKind::PermissionDenied)),
            settings(3),
        );

        let err = probe
            .wait_until_stable(Path::new("clip.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::IoFault { .. }));
    }

    #[tokio::test]
    async fn test_real_unlocked_file_is_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frames").unwrap();

        let probe = FileStabilityProbe::new(fast_settings(3));
        let ready = probe
            .wait_until_stable(&path, &CancellationToken::new())
            .await
            .unwrap();
        if cfg!(any(target_os = "linux", windows)) {
            assert_eq!(ready.attempts, 1);
        } else {
            assert_eq!(ready.attempts, 2);
        }
    }

    #[cfg(any(target_os = "linux", windows))]
    #[tokio::test]
    async fn test_file_held_open_by_writer_times_out() {
        use std::io::Write;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        let mut writer = std::fs::File::create(&path).unwrap();
        writer.write_all(b"partial frames").unwrap();
        writer.flush().unwrap();

        let probe = FileStabilityProbe::new(fast_settings(3));
        let err = probe
            .wait_until_stable(&path, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProbeError::Timeout { attempts: 3, .. }),
            "open writer must keep the file unstable, got {err:?}"
        );

        drop(writer);
        let ready = probe
            .wait_until_stable(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ready.attempts, 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reader_does_not_count_as_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frames").unwrap();
        let _reader = std::fs::File::open(&path).unwrap();

        let probe = FileStabilityProbe::new(fast_settings(3));
        let ready = probe
            .wait_until_stable(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ready.attempts, 1);
    }

    #[test]
    fn test_quiescent_file_waits_for_unchanged_size() {
        use std::io::Write;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frames").unwrap();
        let access = QuiescentFile::default();

        let first = access.try_exclusive(&path).unwrap_err();
        assert_eq!(first.kind(), io::ErrorKind::WouldBlock);

        let mut writer = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writer.write_all(b" more frames").unwrap();
        drop(writer);
        let grown = access.try_exclusive(&path).unwrap_err();
        assert_eq!(grown.kind(), io::ErrorKind::WouldBlock);

        access.try_exclusive(&path).unwrap();
    }

    #[test]
    fn test_quiescent_file_missing_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let access = QuiescentFile::default();
        let err = access.try_exclusive(&dir.path().join("gone.mp4")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_locked_file_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frames").unwrap();

        let writer = std::fs::File::open(&path).unwrap();
        fs2::FileExt::lock_exclusive(&writer).unwrap();

        let probe = FileStabilityProbe::new(fast_settings(2));
        let err = probe
            .wait_until_stable(&path, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { attempts: 2, .. }));

        fs2::FileExt::unlock(&writer).unwrap();
    }
}
