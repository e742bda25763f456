//! Error types for the detect → stabilize → upload pipeline.
//!
//! None of these are fatal to the process: the coordinator logs them against
//! the file being processed and returns to watching.

use std::io;
use std::path::PathBuf;

/// Failure to establish that a newly-detected file has been released by its writer.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The file vanished between the creation event and the probe.
    #[error("file disappeared before it could be probed: {}", .0.display())]
    NotFound(PathBuf),

    /// The file was still held by another writer after the attempt ceiling.
    #[error("file still locked after {attempts} attempts: {}", .path.display())]
    Timeout { path: PathBuf, attempts: u32 },

    /// Any other I/O failure while trying to open the file.
    #[error("I/O error probing {}: {source}", .path.display())]
    IoFault {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Shutdown was requested while waiting.
    #[error("probe cancelled")]
    Cancelled,
}

/// Failure to obtain an access token for the upload API.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The account owner declined the authorization request.
    #[error("authorization was cancelled by the user")]
    UserCancelled,

    #[error("token endpoint unreachable: {0}")]
    TokenEndpoint(String),
}

/// Terminal failure of one upload attempt.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The endpoint answered but refused the request.
    #[error("server rejected upload ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Whether another attempt at the same upload could plausibly succeed.
    ///
    /// Only network-level failures, throttling and server-side faults qualify;
    /// auth, local I/O and client errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportFailure(_) => true,
            Self::ServerRejected { status, .. } => *status == 429 || *status >= 500,
            Self::Auth(_) | Self::Io { .. } | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::ServerRejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::TransportFailure(err.to_string()),
        }
    }
}

/// Invalid values in the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("probe_max_attempts must be at least 1")]
    ZeroProbeAttempts,

    #[error("probe_interval_ms must be greater than 0")]
    ZeroProbeInterval,

    #[error("chunk_size must be a non-zero multiple of {granularity} bytes, got {chunk_size}")]
    ChunkSize { chunk_size: usize, granularity: usize },

    #[error("title_template must not be empty")]
    EmptyTitleTemplate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures_are_retryable() {
        assert!(UploadError::TransportFailure("reset".into()).is_retryable());
    }

    #[test]
    fn test_server_rejection_retryable_only_for_throttle_and_5xx() {
        let rejected = |status| UploadError::ServerRejected {
            status,
            message: String::new(),
        };
        assert!(rejected(503).is_retryable());
        assert!(rejected(429).is_retryable());
        assert!(!rejected(400).is_retryable());
        assert!(!rejected(403).is_retryable());
    }

    #[test]
    fn test_auth_and_cancel_are_not_retryable() {
        assert!(!UploadError::from(AuthError::UserCancelled).is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
    }

    #[test]
    fn test_probe_timeout_message_names_path_and_attempts() {
        let err = ProbeError::Timeout {
            path: PathBuf::from("/rec/clip.mp4"),
            attempts: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("clip.mp4"), "got: {msg}");
        assert!(msg.contains('5'), "got: {msg}");
    }
}
