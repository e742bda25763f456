//! Resumable-upload client for the video-hosting API.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::UploadError;
use crate::upload::auth::Credential;
use crate::upload::metadata::UploadMetadata;

const VIDEO_CONTENT_TYPE: &str = "video/*";

/// Longest slice of an error body kept in `ServerRejected` messages.
const MAX_ERROR_BODY: usize = 512;

/// An upload the server has agreed to receive.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub uri: String,
}

/// Server's answer to one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More bytes are expected; `committed` bytes are safely stored.
    Incomplete { committed: u64 },
    Complete { video_id: String },
}

/// The remote side of an upload.
#[async_trait]
pub trait VideoHost: Send + Sync {
    /// Open an upload session for `total_bytes` of media described by `metadata`.
    async fn begin(
        &self,
        credential: &Credential,
        metadata: &UploadMetadata,
        total_bytes: u64,
    ) -> Result<UploadSession, UploadError>;

    /// Send `chunk`, which starts at byte `offset` of the media.
    async fn send_chunk(
        &self,
        credential: &Credential,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_bytes: u64,
    ) -> Result<ChunkOutcome, UploadError>;
}

#[derive(Debug, Deserialize)]
struct InsertedVideo {
    #[serde(default)]
    id: String,
}

/// YouTube Data API v3 resumable uploads over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVideoHost {
    http: Client,
    base_url: String,
}

impl HttpVideoHost {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// HTTP client suited to long chunk uploads.
    ///
    /// Redirects are disabled: the protocol uses `308` to mean "resume incomplete".
    pub fn http_client(timeout: Duration) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }
}

#[async_trait]
impl VideoHost for HttpVideoHost {
    async fn begin(
        &self,
        credential: &Credential,
        metadata: &UploadMetadata,
        total_bytes: u64,
    ) -> Result<UploadSession, UploadError> {
        let url = format!("{}/upload/youtube/v3/videos", self.base_url);
        let body = json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
            },
            "status": {
                "privacyStatus": metadata.visibility.as_str(),
            },
        });

        let response = self
            .http
            .post(&url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(&credential.access_token)
            .header("X-Upload-Content-Length", total_bytes)
            .header("X-Upload-Content-Type", VIDEO_CONTENT_TYPE)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let status = response.status().as_u16();
        match response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
        {
            Some(uri) => Ok(UploadSession {
                uri: uri.to_string(),
            }),
            None => Err(UploadError::ServerRejected {
                status,
                message: "upload session started without a Location header".to_string(),
            }),
        }
    }

    async fn send_chunk(
        &self,
        credential: &Credential,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_bytes: u64,
    ) -> Result<ChunkOutcome, UploadError> {
        let range = content_range(offset, chunk.len() as u64, total_bytes);
        let response = self
            .http
            .put(&session.uri)
            .bearer_auth(&credential.access_token)
            .header(CONTENT_RANGE, range)
            .body(chunk)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let video: InsertedVideo = response.json().await?;
                Ok(ChunkOutcome::Complete { video_id: video.id })
            }
            StatusCode::PERMANENT_REDIRECT => {
                let committed = response
                    .headers()
                    .get(RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(committed_bytes)
                    .unwrap_or(0);
                Ok(ChunkOutcome::Incomplete { committed })
            }
            _ => Err(rejected(response).await),
        }
    }
}

/// `Content-Range` for a chunk of `len` bytes at `offset`.
fn content_range(offset: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {}-{}/{}", offset, offset + len - 1, total)
    }
}

/// Bytes stored so far, from a `Range: bytes=0-N` header.
fn committed_bytes(range: &str) -> Option<u64> {
    let (_, last) = range.strip_prefix("bytes=")?.split_once('-')?;
    last.trim().parse::<u64>().ok().map(|last| last + 1)
}

async fn rejected(response: Response) -> UploadError {
    let status = response.status().as_u16();
    let mut message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    UploadError::ServerRejected { status, message }
}
