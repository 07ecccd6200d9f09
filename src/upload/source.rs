//! Source media resolution.
//!
//! Turns an opaque source reference into a readable local file. References
//! under the relay storage root are tried in place, then remapped onto a
//! mounted alternate root, then copied out by an external extraction
//! command; anything else is fetched over HTTP into a temp file, one
//! network read chunk at a time.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::UploadError;
use crate::config::{get_upload_http_timeout_secs, Settings};

/// How the local file was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The reference was readable in place under the relay storage root.
    Direct,
    /// The reference was remapped onto the mounted alternate root.
    MountedVolume,
    /// An external command copied the bytes into a temp file.
    ExtractedTemp,
    /// The reference was fetched over HTTP into a temp file.
    DownloadedTemp,
}

impl Provenance {
    /// Whether the resolved path is a temp copy owned by the upload flow.
    #[must_use]
    pub fn is_temp(self) -> bool {
        matches!(self, Self::ExtractedTemp | Self::DownloadedTemp)
    }
}

/// A resolved, readable local media file.
///
/// When [`Provenance::is_temp`] holds, the file is owned by the upload
/// flow: the facade deletes it exactly once after a successful upload and
/// leaves it in place on failure so the bytes stay available for diagnosis.
#[derive(Debug)]
pub struct SourceFile {
    /// Local filesystem path.
    pub path: PathBuf,
    /// How the path was obtained.
    pub provenance: Provenance,
    /// File size in bytes.
    pub len: u64,
}

/// Resolves opaque source references into readable local files.
pub struct SourceResolver {
    http: HttpClient,
    relay_root: PathBuf,
    mount_root: Option<PathBuf>,
    extract_command: Option<String>,
}

impl SourceResolver {
    /// Create a resolver from application settings.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self::with_roots(
            PathBuf::from(&settings.relay_storage_root),
            settings.mounted_media_root.as_ref().map(PathBuf::from),
            settings.extract_command.clone(),
        )
    }

    /// Create a resolver with explicit roots (used by tests and embedders).
    #[must_use]
    pub fn with_roots(
        relay_root: PathBuf,
        mount_root: Option<PathBuf>,
        extract_command: Option<String>,
    ) -> Self {
        Self {
            http: default_client(),
            relay_root,
            mount_root,
            extract_command,
        }
    }

    /// Resolve `reference`, trying access methods in order.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::SourceUnavailable`] when every method fails.
    pub async fn resolve(&self, reference: &str) -> Result<SourceFile, UploadError> {
        let Some(suffix) = self.relay_suffix(reference) else {
            return self.download(reference).await;
        };
        let suffix = suffix.to_path_buf();

        if let Some(found) = stat_file(Path::new(reference), Provenance::Direct).await {
            return Ok(found);
        }
        if let Some(root) = &self.mount_root {
            if let Some(found) = stat_file(&root.join(&suffix), Provenance::MountedVolume).await {
                return Ok(found);
            }
        }
        if let Some(template) = &self.extract_command {
            match extract(template, reference).await {
                Ok(found) => return Ok(found),
                Err(error) => warn!(reference, error = %error, "external extraction failed"),
            }
        }
        Err(UploadError::SourceUnavailable {
            reference: reference.to_string(),
        })
    }

    /// Delete what a finished upload consumed: the temp copy, and the relay
    /// source file so received media does not accumulate indefinitely.
    ///
    /// Called at most once, after terminal success only. On failed uploads
    /// nothing is deleted so the bytes stay available for diagnosis.
    pub async fn cleanup_after_success(&self, source: &SourceFile, reference: &str) {
        if source.provenance.is_temp() {
            remove_logged(&source.path).await;
        }
        if self.relay_suffix(reference).is_some() {
            if !source.provenance.is_temp() {
                remove_logged(&source.path).await;
            }
            if source.path != Path::new(reference) {
                // the relay copy itself, when we uploaded from elsewhere
                let _ = tokio::fs::remove_file(reference).await;
            }
        }
    }

    fn relay_suffix<'a>(&self, reference: &'a str) -> Option<&'a Path> {
        Path::new(reference).strip_prefix(&self.relay_root).ok()
    }

    async fn download(&self, reference: &str) -> Result<SourceFile, UploadError> {
        let response = match self.http.get(reference).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(reference, %error, "remote fetch failed");
                return Err(UploadError::SourceUnavailable {
                    reference: reference.to_string(),
                });
            }
        };
        if !response.status().is_success() {
            warn!(
                reference,
                status = response.status().as_u16(),
                "remote fetch answered with an error status"
            );
            return Err(UploadError::SourceUnavailable {
                reference: reference.to_string(),
            });
        }

        let destination = fresh_temp_path();
        match write_stream(response, &destination).await {
            Ok(len) => {
                debug!(reference, path = %destination.display(), len, "remote source downloaded");
                Ok(SourceFile {
                    path: destination,
                    provenance: Provenance::DownloadedTemp,
                    len,
                })
            }
            Err(error) => {
                warn!(reference, %error, "writing downloaded source failed");
                let _ = tokio::fs::remove_file(&destination).await;
                Err(UploadError::SourceUnavailable {
                    reference: reference.to_string(),
                })
            }
        }
    }
}

fn default_client() -> HttpClient {
    HttpClient::builder()
        .timeout(std::time::Duration::from_secs(get_upload_http_timeout_secs()))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

fn fresh_temp_path() -> PathBuf {
    std::env::temp_dir().join(format!("uplink-{}.media", Uuid::new_v4().simple()))
}

async fn stat_file(path: &Path, provenance: Provenance) -> Option<SourceFile> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {
            debug!(path = %path.display(), ?provenance, len = meta.len(), "source resolved");
            Some(SourceFile {
                path: path.to_path_buf(),
                provenance,
                len: meta.len(),
            })
        }
        Ok(_) => {
            warn!(path = %path.display(), "source reference is not a regular file");
            None
        }
        Err(error) => {
            debug!(path = %path.display(), %error, "source not readable here");
            None
        }
    }
}

/// Run the configured extraction command with `{src}`/`{dst}` substituted.
///
/// The template is split on whitespace and executed without a shell, so
/// references containing shell metacharacters stay inert.
async fn extract(template: &str, reference: &str) -> Result<SourceFile, String> {
    let destination = fresh_temp_path();
    let argv: Vec<String> = template
        .split_whitespace()
        .map(|token| {
            token
                .replace("{src}", reference)
                .replace("{dst}", &destination.to_string_lossy())
        })
        .collect();
    let Some((program, args)) = argv.split_first() else {
        return Err("extract command is empty".to_string());
    };

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|error| format!("spawning {program} failed: {error}"))?;
    if !output.status.success() {
        let _ = tokio::fs::remove_file(&destination).await;
        return Err(format!(
            "extract command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let meta = tokio::fs::metadata(&destination)
        .await
        .map_err(|error| format!("extracted file missing: {error}"))?;
    debug!(reference, path = %destination.display(), len = meta.len(), "source extracted");
    Ok(SourceFile {
        path: destination,
        provenance: Provenance::ExtractedTemp,
        len: meta.len(),
    })
}

async fn write_stream(response: reqwest::Response, destination: &Path) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::create(destination).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn remove_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed consumed source file"),
        Err(error) => warn!(path = %path.display(), %error, "failed to remove consumed source file"),
    }
}
