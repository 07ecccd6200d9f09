//! Wire-level seam between the engine and the backend.
//!
//! The engine only ever sees [`WireResponse`] values, so every decision it
//! makes (offset adoption, expiry detection, retry) is exercised in tests
//! through a scripted fake. The production implementation is
//! [`HttpTransport`](super::http::HttpTransport).

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failure below the HTTP status layer (DNS, connect, TLS, timeout).
#[derive(Debug, Error)]
#[error("network error: {0}")]
pub struct TransportError(pub String);

/// The subset of an HTTP response the engine cares about.
#[derive(Debug, Clone, Default)]
pub struct WireResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Location` header, present on a successful handshake.
    pub location: Option<String>,
    /// Server-acknowledged offset header, when present.
    pub offset: Option<u64>,
    /// Artifact identifier header minted on the final chunk.
    pub artifact: Option<String>,
    /// Response body (error envelopes, direct-path JSON).
    pub body: String,
}

impl WireResponse {
    /// Whether the status is in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body excerpt safe to embed in error messages.
    ///
    /// Proxies occasionally answer with whole HTML error pages; those are
    /// collapsed to a placeholder, and long bodies are truncated.
    #[must_use]
    pub fn body_excerpt(&self) -> String {
        let trimmed = self.body.trim_start();
        if trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html") || trimmed.starts_with("<HTML") {
            return "(HTML error page)".to_string();
        }
        if self.body.len() > 300 {
            let cut = self
                .body
                .char_indices()
                .nth(300)
                .map_or(self.body.len(), |(pos, _)| pos);
            return format!("{}... (truncated)", &self.body[..cut]);
        }
        self.body.clone()
    }
}

/// Handshake request opening a server-side upload session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Total length of the file, declared up front.
    pub total_len: u64,
    /// Pre-encoded metadata block (see [`super::session::encode_metadata`]).
    pub metadata: String,
}

/// One-shot multipart submission for files under the direct-path threshold.
#[derive(Debug, Clone)]
pub struct DirectSubmission {
    /// File name presented to the backend.
    pub file_name: String,
    /// MIME type of the media.
    pub mime_type: String,
    /// Entire file content.
    pub data: Bytes,
    /// Language tag form field.
    pub language: String,
    /// Content classification form field.
    pub classification: String,
    /// Optional title form field.
    pub title: Option<String>,
}

/// Backend transport abstraction.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// `POST` the upload collection endpoint to open a session.
    async fn open_session(&self, request: &SessionRequest)
        -> Result<WireResponse, TransportError>;

    /// `PATCH` one chunk starting at `offset` against the session URI.
    async fn send_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        body: Bytes,
    ) -> Result<WireResponse, TransportError>;

    /// Zero-body `HEAD` probe for the authoritative offset.
    async fn probe(&self, session_uri: &str) -> Result<WireResponse, TransportError>;

    /// One-shot multipart `POST` for small files.
    async fn submit_direct(
        &self,
        submission: DirectSubmission,
    ) -> Result<WireResponse, TransportError>;
}
