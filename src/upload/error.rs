//! Error taxonomy of the upload engine.
//!
//! Every terminal condition is surfaced as a structured value so the
//! consuming layer can render a user-facing message without depending on
//! the engine's control flow. The engine never panics on backend behavior.

use serde::Serialize;
use thiserror::Error;

/// Which layer a chunk delivery failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFailure {
    /// The request never produced an HTTP response.
    Network,
    /// The server kept answering with an error status.
    Server,
    /// The server kept rejecting the declared offset.
    OffsetConflict,
}

/// Errors produced by the upload engine.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No resolution strategy could produce a readable local file.
    #[error("source media is not accessible: {reference}")]
    SourceUnavailable {
        /// The opaque reference that could not be resolved.
        reference: String,
    },
    /// The backend refused the upload outright (handshake or direct
    /// submission). Not retried locally.
    #[error("backend rejected the upload: {message}")]
    Rejected {
        /// True when the backend answered with a rate-limit status.
        rate_limited: bool,
        /// Backend-supplied rejection detail.
        message: String,
    },
    /// A chunk could not be delivered within the retry budget.
    #[error("chunk at offset {offset} failed after {attempts} attempts: {message}")]
    ChunkFailed {
        /// Failure layer of the last attempt.
        kind: ChunkFailure,
        /// Starting offset of the chunk that gave up.
        offset: u64,
        /// Attempts consumed before giving up.
        attempts: u32,
        /// Last observed error message.
        message: String,
    },
    /// The server-side session vanished more often than the restart bound
    /// allows.
    #[error("upload session was lost {restarts} times, giving up")]
    SessionLost {
        /// Restarts performed before giving up.
        restarts: u32,
    },
    /// The backend answered with a shape the engine cannot interpret.
    #[error("unexpected backend response: {0}")]
    BadResponse(String),
}

impl UploadError {
    /// Stable machine-readable code for the notification layer.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::Rejected { rate_limited: true, .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::ChunkFailed { .. } => "transfer_failed",
            Self::SessionLost { .. } => "session_lost",
            Self::BadResponse(_) => "bad_response",
        }
    }

    /// Whether the backend explicitly rate-limited us.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Rejected { rate_limited: true, .. })
    }

    /// Whether retrying the whole operation later is sensible.
    ///
    /// Exhausted transfer budgets and rate limits are worth another pass
    /// once conditions change; an unreadable source or a malformed backend
    /// response is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChunkFailed { .. } | Self::SessionLost { .. } => true,
            Self::Rejected { rate_limited, .. } => *rate_limited,
            Self::SourceUnavailable { .. } | Self::BadResponse(_) => false,
        }
    }

    /// User-presentable view for the webhook/notification collaborator.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            rate_limited: self.is_rate_limited(),
        }
    }
}

/// Serializable error summary handed to the notification layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying the whole operation later is sensible.
    pub retryable: bool,
    /// Whether the backend explicitly rate-limited us.
    pub rate_limited: bool,
}
