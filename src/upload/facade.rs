//! Externally consumed upload entry point.
//!
//! Resolves the source reference, routes by size (small files go out as a
//! single in-memory multipart request, large ones through the chunked
//! engine under the recovery controller), and cleans up consumed files
//! after terminal success.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::classify;
use super::error::UploadError;
use super::http::HttpTransport;
use super::recovery::ResumableUpload;
use super::retry::RetryPolicy;
use super::source::{SourceFile, SourceResolver};
use super::transfer::TransferProgress;
use super::transport::{DirectSubmission, UploadTransport};
use super::{UploadOptions, UploadedMedia};
use crate::config::{Settings, CHUNK_SIZE_BYTES, DIRECT_UPLOAD_MAX_BYTES, SESSION_MAX_RESTARTS};

/// Accepted locations of the artifact id in the direct-path response
/// envelope. The backend has drifted between these shapes; all are read.
const ARTIFACT_ID_PATHS: &[&[&str]] = &[
    &["id"],
    &["media", "id"],
    &["data", "id"],
    &["result", "media_id"],
];

/// Moves one media file into the backend service.
///
/// Independent uploads may run concurrently, each on its own task; keeping
/// a single upload per end user is the calling layer's job (see
/// [`crate::flow::FlowRegistry`]).
pub struct Uploader {
    transport: Arc<dyn UploadTransport>,
    resolver: SourceResolver,
    policy: RetryPolicy,
    chunk_size: usize,
    direct_max_bytes: u64,
    max_restarts: u32,
    progress: Option<mpsc::Sender<TransferProgress>>,
}

impl Uploader {
    /// Create an uploader talking to the configured backend.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self::with_transport(
            Arc::new(HttpTransport::from_settings(settings)),
            SourceResolver::new(settings),
        )
    }

    /// Create an uploader over an explicit transport and resolver.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn UploadTransport>, resolver: SourceResolver) -> Self {
        Self {
            transport,
            resolver,
            policy: RetryPolicy::default(),
            chunk_size: CHUNK_SIZE_BYTES,
            direct_max_bytes: DIRECT_UPLOAD_MAX_BYTES,
            max_restarts: SESSION_MAX_RESTARTS,
            progress: None,
        }
    }

    /// Override the chunk retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the chunk size.
    #[must_use]
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Override the simple/chunked size threshold.
    #[must_use]
    pub fn direct_threshold(mut self, bytes: u64) -> Self {
        self.direct_max_bytes = bytes;
        self
    }

    /// Override the session restart bound.
    #[must_use]
    pub fn max_restarts(mut self, restarts: u32) -> Self {
        self.max_restarts = restarts;
        self
    }

    /// Receive a progress notification after every acknowledged chunk.
    #[must_use]
    pub fn progress_channel(mut self, sender: mpsc::Sender<TransferProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Upload the media behind `reference`.
    ///
    /// On success, temp copies made during resolution and consumed relay
    /// sources are deleted exactly once. On failure nothing is deleted, so
    /// the bytes stay available for diagnosis and a later retry.
    ///
    /// # Errors
    ///
    /// Any [`UploadError`]; see the taxonomy in [`super::error`].
    pub async fn upload(
        &self,
        reference: &str,
        options: UploadOptions,
    ) -> Result<UploadedMedia, UploadError> {
        let source = self.resolver.resolve(reference).await?;
        debug!(
            reference,
            provenance = ?source.provenance,
            len = source.len,
            "source resolved"
        );

        let artifact = if source.len <= self.direct_max_bytes {
            self.submit_direct(&source, &options).await?
        } else {
            ResumableUpload {
                transport: self.transport.as_ref(),
                policy: self.policy,
                chunk_size: self.chunk_size,
                max_restarts: self.max_restarts,
                progress: self.progress.clone(),
            }
            .run(&options, &source.path, source.len)
            .await?
        };

        self.resolver.cleanup_after_success(&source, reference).await;
        info!(
            reference,
            artifact = artifact.as_deref().unwrap_or("-"),
            "upload finished"
        );
        Ok(UploadedMedia { artifact })
    }

    async fn submit_direct(
        &self,
        source: &SourceFile,
        options: &UploadOptions,
    ) -> Result<Option<String>, UploadError> {
        // Small files fit in memory whole; a resumable session is not
        // worth its protocol overhead below the threshold.
        let data = tokio::fs::read(&source.path).await.map_err(|_| {
            UploadError::SourceUnavailable {
                reference: source.path.display().to_string(),
            }
        })?;
        let submission = DirectSubmission {
            file_name: options.file_name.clone(),
            mime_type: options.mime_type.clone(),
            data: Bytes::from(data),
            language: options.language.clone(),
            classification: options.classification.clone(),
            title: options.title.clone(),
        };
        let response = self
            .transport
            .submit_direct(submission)
            .await
            .map_err(|error| UploadError::Rejected {
                rate_limited: false,
                message: error.to_string(),
            })?;

        if response.is_success() {
            return parse_artifact_id(&response.body).map(Some);
        }
        let message = parse_error_envelope(&response.body)
            .map(|(code, message)| format!("{code}: {message}"))
            .unwrap_or_else(|| format!("HTTP {}: {}", response.status, response.body_excerpt()));
        Err(UploadError::Rejected {
            rate_limited: classify::is_rate_limited(response.status),
            message,
        })
    }
}

/// Read the artifact id from whichever accepted envelope shape matches.
fn parse_artifact_id(body: &str) -> Result<String, UploadError> {
    let value: Value = serde_json::from_str(body).map_err(|error| {
        UploadError::BadResponse(format!("submission response is not JSON: {error}"))
    })?;
    for path in ARTIFACT_ID_PATHS {
        let mut current = &value;
        let mut found = true;
        for key in *path {
            match current.get(key) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        match current {
            Value::String(id) if !id.is_empty() => return Ok(id.clone()),
            Value::Number(id) => return Ok(id.to_string()),
            _ => {}
        }
    }
    Err(UploadError::BadResponse(
        "submission response carries no artifact id".to_string(),
    ))
}

/// Parse a structured `{code, message}` error body, when present.
fn parse_error_envelope(body: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let code = match value.get("code")? {
        Value::String(code) => code.clone(),
        Value::Number(code) => code.to_string(),
        _ => return None,
    };
    let message = value.get("message")?.as_str()?.to_string();
    Some((code, message))
}
