//! Resumable media upload engine.
//!
//! Control flow: [`Uploader`] resolves the source reference into a local
//! file, then either submits it as a single multipart request (small files)
//! or streams it in fixed-size chunks against a server-side session, with
//! per-chunk retry and a bounded full-session recovery loop. On success the
//! facade cleans up temp files and the consumed relay source.

pub mod classify;
pub mod error;
pub mod facade;
pub mod http;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod source;
pub mod transfer;
pub mod transport;

pub use error::{ChunkFailure, ErrorReport, UploadError};
pub use facade::Uploader;
pub use retry::RetryPolicy;
pub use session::UploadSession;
pub use source::{Provenance, SourceFile, SourceResolver};
pub use transfer::TransferProgress;
pub use transport::{UploadTransport, WireResponse};

/// Caller-supplied description of the media being uploaded.
///
/// Immutable for the duration of one upload; free-text fields may contain
/// arbitrary unicode and are transported base64-encoded in the handshake.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// File name presented to the backend.
    pub file_name: String,
    /// MIME type of the media.
    pub mime_type: String,
    /// Language tag of the content.
    pub language: String,
    /// Content classification label.
    pub classification: String,
    /// Optional human-readable title.
    pub title: Option<String>,
}

/// Successful upload outcome.
#[derive(Debug, Clone)]
pub struct UploadedMedia {
    /// Backend-minted artifact identifier, when the backend reported one.
    pub artifact: Option<String>,
}
