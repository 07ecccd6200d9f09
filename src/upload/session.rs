//! Upload session handshake and bookkeeping.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::info;

use super::classify;
use super::error::UploadError;
use super::transport::{SessionRequest, UploadTransport};
use super::UploadOptions;

/// Server-side context of one in-progress resumable upload.
///
/// Created on a successful handshake. The offset only moves on explicit
/// server acknowledgement (or a server-declared correction); local progress
/// is never assumed. Discarded on completion, terminal failure or detected
/// expiry.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// URI the chunks are PATCHed against.
    pub uri: String,
    /// Total byte length declared at the handshake.
    pub total_len: u64,
    /// Last server-acknowledged offset.
    pub offset: u64,
}

/// Encode free-text metadata for the header-constrained channel.
///
/// Produces comma-joined `key base64(value)` pairs, filtering pairs with
/// empty values. Base64 keeps arbitrary unicode (titles, file names) legal
/// in a header.
#[must_use]
pub fn encode_metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key} {}", BASE64.encode(value.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

fn metadata_for(options: &UploadOptions) -> String {
    encode_metadata(&[
        ("filename", options.file_name.as_str()),
        ("filetype", options.mime_type.as_str()),
        ("language", options.language.as_str()),
        ("classification", options.classification.as_str()),
        ("title", options.title.as_deref().unwrap_or("")),
    ])
}

/// Open a server-side session declaring `total_len` bytes.
///
/// # Errors
///
/// [`UploadError::Rejected`] when the backend answers anything but `201`
/// (with `rate_limited` set on a 429) or the request itself fails, and
/// [`UploadError::BadResponse`] when a `201` arrives without a session URI.
pub async fn open_session(
    transport: &dyn UploadTransport,
    options: &UploadOptions,
    total_len: u64,
) -> Result<UploadSession, UploadError> {
    let request = SessionRequest {
        total_len,
        metadata: metadata_for(options),
    };
    let response = transport
        .open_session(&request)
        .await
        .map_err(|error| UploadError::Rejected {
            rate_limited: false,
            message: error.to_string(),
        })?;

    if response.status == 201 {
        let uri = response.location.clone().ok_or_else(|| {
            UploadError::BadResponse("handshake response carries no session URI".to_string())
        })?;
        info!(uri = %uri, total_len, "upload session opened");
        return Ok(UploadSession {
            uri,
            total_len,
            offset: 0,
        });
    }

    if classify::is_rate_limited(response.status) {
        return Err(UploadError::Rejected {
            rate_limited: true,
            message: format!("backend rate-limited the handshake: {}", response.body_excerpt()),
        });
    }
    Err(UploadError::Rejected {
        rate_limited: false,
        message: format!(
            "handshake answered {}: {}",
            response.status,
            response.body_excerpt()
        ),
    })
}
