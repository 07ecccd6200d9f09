//! Bounded full-session recovery.
//!
//! The resumable protocol has no way to reattach to a lost session, so on
//! a detected expiry the whole file is retransmitted under a brand-new
//! session from offset 0. Restarts are bounded; exceeding the bound is a
//! terminal session-lost error.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::{error, warn};

use super::error::UploadError;
use super::retry::RetryPolicy;
use super::session;
use super::transfer::{ChunkTransfer, TransferFault, TransferProgress};
use super::transport::UploadTransport;
use super::UploadOptions;

/// Supervises "open a session, then stream chunks" with bounded restarts.
pub(crate) struct ResumableUpload<'a> {
    pub transport: &'a dyn UploadTransport,
    pub policy: RetryPolicy,
    pub chunk_size: usize,
    pub max_restarts: u32,
    pub progress: Option<mpsc::Sender<TransferProgress>>,
}

impl ResumableUpload<'_> {
    pub(crate) async fn run(
        &self,
        options: &UploadOptions,
        path: &Path,
        total_len: u64,
    ) -> Result<Option<String>, UploadError> {
        let mut restarts = 0u32;
        loop {
            let mut upload_session =
                session::open_session(self.transport, options, total_len).await?;
            let engine = ChunkTransfer {
                transport: self.transport,
                policy: self.policy,
                chunk_size: self.chunk_size,
                progress: self.progress.clone(),
            };
            match engine.run(&mut upload_session, path).await {
                Ok(artifact) => {
                    debug_assert_eq!(upload_session.offset, total_len);
                    return Ok(artifact);
                }
                Err(TransferFault::Fatal(error)) => return Err(error),
                Err(TransferFault::Expired) => {
                    restarts += 1;
                    if restarts > self.max_restarts {
                        error!(
                            restarts = restarts - 1,
                            "session lost again, restart budget exhausted"
                        );
                        return Err(UploadError::SessionLost {
                            restarts: restarts - 1,
                        });
                    }
                    warn!(
                        restart = restarts,
                        max = self.max_restarts,
                        "upload session lost, retransmitting from offset 0"
                    );
                }
            }
        }
    }
}
