pub mod auth;
pub mod client;
pub mod metadata;
pub mod progress;

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Local};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::UploadError;
use auth::CredentialProvider;
use client::{ChunkOutcome, VideoHost};
use metadata::{MetadataPolicy, UploadMetadata};
use progress::{UploadProgressEvent, UploadStream};

/// Progress events buffered ahead of a slow consumer.
const PROGRESS_BUFFER: usize = 32;

/// Consecutive chunks without forward progress before the upload is abandoned.
const MAX_STALLED_CHUNKS: u32 = 3;

/// Streams one file to the video host and reports how it went.
///
/// Every call to [`upload`](Self::upload) is a single attempt: failures end
/// the stream with a `Failed` event and nothing is retried here.
#[derive(Clone)]
pub struct UploadOrchestrator {
    credentials: Arc<dyn CredentialProvider>,
    host: Arc<dyn VideoHost>,
    policy: MetadataPolicy,
    chunk_size: usize,
}

impl UploadOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        host: Arc<dyn VideoHost>,
        policy: MetadataPolicy,
        chunk_size: usize,
    ) -> Self {
        Self {
            credentials,
            host,
            policy,
            chunk_size,
        }
    }

    pub fn metadata_for(&self, path: &Path, detected_at: DateTime<Local>) -> UploadMetadata {
        UploadMetadata::from_policy(&self.policy, path, detected_at)
    }

    /// Start uploading `path` in the background.
    ///
    /// The returned stream yields one `Uploading` event per acknowledged chunk
    /// and ends with exactly one `Completed` or `Failed` event. Cancelling
    /// `cancel` aborts the transfer and ends the stream with
    /// [`UploadError::Cancelled`].
    pub fn upload(
        &self,
        path: &Path,
        detected_at: DateTime<Local>,
        cancel: CancellationToken,
    ) -> UploadStream {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let orchestrator = self.clone();
        let path = path.to_path_buf();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
                result = orchestrator.transfer(&path, detected_at, &tx) => result,
            };
            let terminal = match outcome {
                Ok(video_id) => UploadProgressEvent::Completed { video_id },
                Err(error) => UploadProgressEvent::Failed { error },
            };
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(terminal).await;
        });

        UploadStream::new(rx)
    }

    async fn transfer(
        &self,
        path: &Path,
        detected_at: DateTime<Local>,
        tx: &mpsc::Sender<UploadProgressEvent>,
    ) -> Result<String, UploadError> {
        let credential = self.credentials.credential().await?;
        let metadata = self.metadata_for(path, detected_at);

        let mut file = File::open(path).await.map_err(|e| io_error(path, e))?;
        let total_bytes = file
            .metadata()
            .await
            .map_err(|e| io_error(path, e))?
            .len();

        info!(
            path = %path.display(),
            title = %metadata.title,
            visibility = %metadata.visibility,
            total_bytes,
            "starting upload"
        );
        let session = self.host.begin(&credential, &metadata, total_bytes).await?;

        let mut offset = 0u64;
        let mut stalled = 0u32;
        loop {
            let chunk = read_chunk(&mut file, self.chunk_size)
                .await
                .map_err(|e| io_error(path, e))?;
            let sent_to = offset + chunk.len() as u64;

            let outcome = self
                .host
                .send_chunk(&credential, &session, offset, chunk, total_bytes)
                .await?;

            match outcome {
                ChunkOutcome::Complete { video_id } => {
                    if video_id.trim().is_empty() {
                        return Err(UploadError::ServerRejected {
                            status: 200,
                            message: "upload finished without a video id".to_string(),
                        });
                    }
                    return Ok(video_id);
                }
                ChunkOutcome::Incomplete { committed } => {
                    let _ = tx
                        .send(UploadProgressEvent::Uploading {
                            bytes_sent: committed,
                            total_bytes,
                        })
                        .await;

                    if committed >= total_bytes {
                        return Err(UploadError::ServerRejected {
                            status: 308,
                            message: "server kept the session open after receiving every byte"
                                .to_string(),
                        });
                    }

                    if committed <= offset {
                        stalled += 1;
                        if stalled >= MAX_STALLED_CHUNKS {
                            return Err(UploadError::TransportFailure(format!(
                                "no progress after {stalled} chunks at byte {committed}"
                            )));
                        }
                    } else {
                        stalled = 0;
                    }

                    if committed != sent_to {
                        debug!(committed, sent_to, "resuming from server-committed offset");
                        file.seek(SeekFrom::Start(committed))
                            .await
                            .map_err(|e| io_error(path, e))?;
                    }
                    offset = committed;
                }
            }
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> UploadError {
    UploadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read up to `chunk_size` bytes from the current position.
async fn read_chunk(file: &mut File, chunk_size: usize) -> std::io::Result<Bytes> {
    let mut buf = Vec::with_capacity(chunk_size);
    (&mut *file)
        .take(chunk_size as u64)
        .read_to_end(&mut buf)
        .await?;
    Ok(Bytes::from(buf))
}
