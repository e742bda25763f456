use tokio::sync::mpsc;

use crate::error::UploadError;

/// Notification emitted while one file is uploaded.
///
/// A stream of these ends with exactly one terminal event
/// (`Completed` or `Failed`).
#[derive(Debug)]
pub enum UploadProgressEvent {
    /// The server acknowledged another chunk.
    Uploading { bytes_sent: u64, total_bytes: u64 },
    /// The upload finished; `video_id` is never empty.
    Completed { video_id: String },
    Failed { error: UploadError },
}

impl UploadProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Uploading { .. })
    }

    /// Short tag for logs and reports.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Uploading { .. } => "uploading",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Receiving end of one upload's progress events.
///
/// Finite and not restartable: once the terminal event has been returned,
/// `next` yields `None`.
#[derive(Debug)]
pub struct UploadStream {
    rx: mpsc::Receiver<UploadProgressEvent>,
    finished: bool,
}

impl UploadStream {
    pub(crate) fn new(rx: mpsc::Receiver<UploadProgressEvent>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<UploadProgressEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        match &event {
            Some(event) if event.is_terminal() => self.finished = true,
            None => self.finished = true,
            Some(_) => {}
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_stops_after_terminal_event() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(UploadProgressEvent::Uploading {
            bytes_sent: 10,
            total_bytes: 20,
        })
        .await
        .unwrap();
        tx.send(UploadProgressEvent::Completed {
            video_id: "abc".into(),
        })
        .await
        .unwrap();
        tx.send(UploadProgressEvent::Uploading {
            bytes_sent: 20,
            total_bytes: 20,
        })
        .await
        .unwrap();

        let mut stream = UploadStream::new(rx);
        assert_eq!(stream.next().await.map(|e| e.phase()), Some("uploading"));
        assert_eq!(stream.next().await.map(|e| e.phase()), Some("completed"));
        assert!(stream.next().await.is_none());
    }
}
