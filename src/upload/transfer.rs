//! Chunked transfer engine.
//!
//! Streams an open file against a server-side session in fixed-size
//! chunks, one request at a time, in increasing offset order. At most one
//! chunk's worth of bytes is resident in memory, which is what keeps
//! multi-hundred-MB transfers safe. The loop is the state machine: sending
//! alternates with backing off on transient failures, reconciles on an
//! offset conflict, aborts on a detected expiry, and completes when the
//! acknowledged offset reaches the declared length.
//!
//! The file handle is opened read-only and dropped on every exit path.

use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::classify;
use super::error::{ChunkFailure, UploadError};
use super::retry::RetryPolicy;
use super::session::UploadSession;
use super::transport::{UploadTransport, WireResponse};

/// Progress notification emitted after every acknowledged chunk.
///
/// Delivered with `try_send`: if the consumer lags, updates are dropped
/// rather than stalling the transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    /// Bytes the server has acknowledged so far.
    pub bytes_acknowledged: u64,
    /// Declared total length.
    pub total_len: u64,
}

/// Why the engine stopped, as seen by the recovery controller.
#[derive(Debug)]
pub(crate) enum TransferFault {
    /// The session vanished server-side; a full restart may succeed.
    Expired,
    /// Terminal error to surface unchanged.
    Fatal(UploadError),
}

/// Per-chunk retry bookkeeping; lives for one chunk's delivery loop.
#[derive(Debug)]
struct ChunkAttempt {
    offset: u64,
    size: usize,
    attempt: u32,
    kind: ChunkFailure,
    last_error: String,
}

enum ChunkOutcome {
    Accepted(Option<String>),
    /// Server corrected the offset; resend immediately, no backoff.
    Corrected,
    Backoff,
}

/// One session's chunk delivery loop.
pub(crate) struct ChunkTransfer<'a> {
    pub transport: &'a dyn UploadTransport,
    pub policy: RetryPolicy,
    pub chunk_size: usize,
    pub progress: Option<mpsc::Sender<TransferProgress>>,
}

impl ChunkTransfer<'_> {
    /// Drive `session` to completion, returning the artifact id when the
    /// backend minted one on the final chunk.
    pub(crate) async fn run(
        &self,
        session: &mut UploadSession,
        path: &Path,
    ) -> Result<Option<String>, TransferFault> {
        let mut file = File::open(path).await.map_err(|error| {
            warn!(path = %path.display(), %error, "cannot open source for transfer");
            TransferFault::Fatal(UploadError::SourceUnavailable {
                reference: path.display().to_string(),
            })
        })?;

        let mut artifact = None;
        while session.offset < session.total_len {
            if let Some(id) = self.deliver_chunk(&mut file, session, path).await? {
                artifact = Some(id);
            }
            if let Some(tx) = &self.progress {
                let _ = tx.try_send(TransferProgress {
                    bytes_acknowledged: session.offset,
                    total_len: session.total_len,
                });
            }
        }
        info!(total_len = session.total_len, "transfer completed");
        Ok(artifact)
    }

    /// Deliver the chunk starting at the session's current offset, within
    /// the policy's attempt budget. An offset conflict consumes one attempt
    /// and is resent immediately at the server-declared offset; the body is
    /// re-read from disk after every correction, so a correction can never
    /// duplicate or gap data.
    async fn deliver_chunk(
        &self,
        file: &mut File,
        session: &mut UploadSession,
        path: &Path,
    ) -> Result<Option<String>, TransferFault> {
        let mut attempt = ChunkAttempt {
            offset: session.offset,
            size: 0,
            attempt: 0,
            kind: ChunkFailure::Network,
            last_error: String::new(),
        };

        loop {
            attempt.attempt += 1;
            if attempt.attempt > self.policy.max_attempts {
                warn!(
                    offset = attempt.offset,
                    attempts = attempt.attempt - 1,
                    "chunk retry budget exhausted"
                );
                return Err(TransferFault::Fatal(UploadError::ChunkFailed {
                    kind: attempt.kind,
                    offset: attempt.offset,
                    attempts: attempt.attempt - 1,
                    message: attempt.last_error,
                }));
            }
            if attempt.attempt > 2 {
                // From the second retry on, learn the authoritative offset
                // before resending: the previous acknowledgement may have
                // been lost in transit.
                self.resync(session).await?;
            }
            if session.offset >= session.total_len {
                // A correction revealed the lost send actually landed and
                // finished the file; nothing left to resend.
                return Ok(None);
            }
            attempt.offset = session.offset;

            let want = chunk_len(self.chunk_size, session);
            let body = read_chunk(file, session.offset, want).await.map_err(|error| {
                warn!(path = %path.display(), offset = session.offset, %error, "chunk read failed");
                TransferFault::Fatal(UploadError::SourceUnavailable {
                    reference: path.display().to_string(),
                })
            })?;
            attempt.size = body.len();

            match self
                .transport
                .send_chunk(&session.uri, session.offset, body)
                .await
            {
                Err(error) => {
                    attempt.kind = ChunkFailure::Network;
                    attempt.last_error = error.to_string();
                    self.backoff(&attempt).await;
                }
                Ok(response) => match self.handle_response(session, &mut attempt, &response)? {
                    ChunkOutcome::Accepted(id) => return Ok(id),
                    ChunkOutcome::Corrected => {}
                    ChunkOutcome::Backoff => self.backoff(&attempt).await,
                },
            }
        }
    }

    fn handle_response(
        &self,
        session: &mut UploadSession,
        attempt: &mut ChunkAttempt,
        response: &WireResponse,
    ) -> Result<ChunkOutcome, TransferFault> {
        if classify::is_session_expired(response.status, &response.body) {
            warn!(
                status = response.status,
                offset = session.offset,
                "session expired mid-transfer"
            );
            return Err(TransferFault::Expired);
        }

        if response.is_success() {
            let Some(new_offset) = response.offset else {
                return Err(TransferFault::Fatal(UploadError::BadResponse(
                    "chunk acknowledgement carries no offset".to_string(),
                )));
            };
            // The server is authoritative but must stay within what was
            // actually sent: anything else would gap or rewind the stream.
            let sent_end = attempt.offset + attempt.size as u64;
            if new_offset <= attempt.offset || new_offset > sent_end {
                return Err(TransferFault::Fatal(UploadError::BadResponse(format!(
                    "acknowledged offset {new_offset} outside sent range ({} ..= {sent_end}]",
                    attempt.offset
                ))));
            }
            debug!(from = attempt.offset, to = new_offset, "chunk acknowledged");
            session.offset = new_offset;
            return Ok(ChunkOutcome::Accepted(response.artifact.clone()));
        }

        if response.status == 409 {
            let Some(server_offset) = response.offset else {
                return Err(TransferFault::Fatal(UploadError::BadResponse(
                    "conflict response carries no offset".to_string(),
                )));
            };
            warn!(
                ours = attempt.offset,
                theirs = server_offset,
                "offset conflict, adopting server offset"
            );
            attempt.kind = ChunkFailure::OffsetConflict;
            attempt.last_error = format!("server insisted on offset {server_offset}");
            session.offset = server_offset;
            return Ok(ChunkOutcome::Corrected);
        }

        if classify::is_transient(response.status) {
            attempt.kind = ChunkFailure::Server;
            attempt.last_error =
                format!("HTTP {}: {}", response.status, response.body_excerpt());
            return Ok(ChunkOutcome::Backoff);
        }

        // A non-transient rejection will not improve with resends.
        Err(TransferFault::Fatal(UploadError::ChunkFailed {
            kind: ChunkFailure::Server,
            offset: attempt.offset,
            attempts: attempt.attempt,
            message: format!("HTTP {}: {}", response.status, response.body_excerpt()),
        }))
    }

    async fn resync(&self, session: &mut UploadSession) -> Result<(), TransferFault> {
        match self.transport.probe(&session.uri).await {
            Err(error) => {
                // Probe failures are not fatal: the next PATCH will either
                // land or come back with an authoritative conflict.
                warn!(%error, "offset probe failed, resending blind");
                Ok(())
            }
            Ok(response) if classify::is_session_expired(response.status, &response.body) => {
                warn!(status = response.status, "session expired during offset probe");
                Err(TransferFault::Expired)
            }
            Ok(response) => {
                if response.is_success() {
                    if let Some(server_offset) = response.offset {
                        if server_offset != session.offset {
                            info!(
                                ours = session.offset,
                                theirs = server_offset,
                                "probe corrected offset"
                            );
                            session.offset = server_offset;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    async fn backoff(&self, attempt: &ChunkAttempt) {
        let delay = self.policy.delay_after(attempt.attempt);
        debug!(
            offset = attempt.offset,
            attempt = attempt.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %attempt.last_error,
            "chunk attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

fn chunk_len(chunk_size: usize, session: &UploadSession) -> usize {
    std::cmp::min(
        chunk_size as u64,
        session.total_len.saturating_sub(session.offset),
    ) as usize
}

async fn read_chunk(file: &mut File, offset: u64, len: usize) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
