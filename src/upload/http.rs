//! reqwest-backed implementation of [`UploadTransport`].
//!
//! Speaks the backend's resumable protocol: handshake `POST` against the
//! collection endpoint, offset-addressed chunk `PATCH`es, zero-body `HEAD`
//! probes, and the multipart `POST` used for small files.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, RequestBuilder, Response};

use super::transport::{
    DirectSubmission, SessionRequest, TransportError, UploadTransport, WireResponse,
};
use crate::config::{get_upload_http_timeout_secs, Settings};

/// Fixed protocol version token sent on every resumable-protocol request.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// Header carrying the protocol version token.
pub const HEADER_PROTOCOL: &str = "Tus-Resumable";
/// Header declaring the total upload length on the handshake.
pub const HEADER_LENGTH: &str = "Upload-Length";
/// Header carrying the base64 metadata block on the handshake.
pub const HEADER_METADATA: &str = "Upload-Metadata";
/// Header carrying the declared or acknowledged byte offset.
pub const HEADER_OFFSET: &str = "Upload-Offset";
/// Header carrying the artifact id minted on the final chunk.
pub const HEADER_ARTIFACT: &str = "X-Media-Id";
/// Content type of raw chunk bodies.
pub const CHUNK_CONTENT_TYPE: &str = "application/offset+octet-stream";

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        Self(error.to_string())
    }
}

/// Production transport talking to the backend media service.
pub struct HttpTransport {
    client: HttpClient,
    collection_url: String,
    token: String,
}

impl HttpTransport {
    /// Create a transport against the given upload collection endpoint.
    #[must_use]
    pub fn new(collection_url: impl Into<String>, token: impl Into<String>) -> Self {
        let timeout = Duration::from_secs(get_upload_http_timeout_secs());
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            client,
            collection_url: collection_url.into(),
            token: token.into(),
        }
    }

    /// Create a transport from application settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.backend_endpoint, &settings.backend_token)
    }

    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.token))
            .header(HEADER_PROTOCOL, PROTOCOL_VERSION)
    }

    async fn read_wire(&self, response: Response) -> WireResponse {
        let status = response.status().as_u16();
        let header = |name: &str| -> Option<String> {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let location = header("Location").map(|loc| absolutize(&self.collection_url, &loc));
        let offset = header(HEADER_OFFSET).and_then(|value| value.parse().ok());
        let artifact = header(HEADER_ARTIFACT);
        let body = response.text().await.unwrap_or_default();
        WireResponse {
            status,
            location,
            offset,
            artifact,
            body,
        }
    }
}

/// Resolve a possibly relative `Location` header against the collection URL.
fn absolutize(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    if let Ok(base_url) = reqwest::Url::parse(base) {
        if let Ok(joined) = base_url.join(location) {
            return joined.to_string();
        }
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        location.trim_start_matches('/')
    )
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn open_session(
        &self,
        request: &SessionRequest,
    ) -> Result<WireResponse, TransportError> {
        let response = self
            .decorate(self.client.post(&self.collection_url))
            .header(HEADER_LENGTH, request.total_len)
            .header(HEADER_METADATA, request.metadata.as_str())
            .send()
            .await?;
        Ok(self.read_wire(response).await)
    }

    async fn send_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        body: Bytes,
    ) -> Result<WireResponse, TransportError> {
        let response = self
            .decorate(self.client.patch(session_uri))
            .header(HEADER_OFFSET, offset)
            .header("Content-Type", CHUNK_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        Ok(self.read_wire(response).await)
    }

    async fn probe(&self, session_uri: &str) -> Result<WireResponse, TransportError> {
        let response = self.decorate(self.client.head(session_uri)).send().await?;
        Ok(self.read_wire(response).await)
    }

    async fn submit_direct(
        &self,
        submission: DirectSubmission,
    ) -> Result<WireResponse, TransportError> {
        let part = Part::bytes(submission.data.to_vec())
            .file_name(submission.file_name)
            .mime_str(&submission.mime_type)
            .map_err(|error| TransportError(format!("invalid mime type: {error}")))?;
        let mut form = Form::new()
            .part("file", part)
            .text("language", submission.language)
            .text("classification", submission.classification);
        if let Some(title) = submission.title.filter(|title| !title.is_empty()) {
            form = form.text("title", title);
        }
        let response = self
            .client
            .post(&self.collection_url)
            .header("Authorization", format!("Bearer {}", self.token))
            .multipart(form)
            .send()
            .await?;
        Ok(self.read_wire(response).await)
    }
}
