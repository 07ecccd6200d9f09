//! Response classification predicates.
//!
//! Pure functions over `(status, body)` shared by the handshake, chunk and
//! probe paths. Kept free of transport types so the heuristics stay
//! independently unit-testable.

/// Body phrases that mark a server-side session as gone.
///
/// The backend does not report expiry with a dedicated status: besides a
/// plain 404, dead sessions surface as assorted 4xx/5xx responses whose
/// bodies mention the missing upload. Matching is case-insensitive.
const SESSION_GONE_PHRASES: &[&str] = &[
    "session not found",
    "session has expired",
    "session expired",
    "upload not found",
    "upload expired",
    "no such upload",
    "unknown upload",
    "invalid upload id",
    "upload is gone",
];

/// Check if the backend explicitly rate-limited the request.
#[must_use]
pub fn is_rate_limited(status: u16) -> bool {
    status == 429
}

/// Check if a response means the upload session no longer exists.
///
/// A `404` always does; any other error status does when the body matches
/// the phrase table above.
#[must_use]
pub fn is_session_expired(status: u16, body: &str) -> bool {
    if status == 404 {
        return true;
    }
    if status < 400 {
        return false;
    }
    let lowered = body.to_ascii_lowercase();
    SESSION_GONE_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// Check if an error status is worth retrying the same request.
#[must_use]
pub fn is_transient(status: u16) -> bool {
    status >= 500 || status == 408
}
