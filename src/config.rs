//! Configuration and settings management
//!
//! Loads settings from environment variables and configuration files and
//! defines the tuning constants of the upload engine.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application settings loaded from configuration files and environment
/// variables.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Upload collection endpoint of the backend media service.
    pub backend_endpoint: String,

    /// Bearer token presented on every backend request.
    pub backend_token: String,

    /// Directory under which the media relay deposits received files.
    #[serde(default = "default_relay_root")]
    pub relay_storage_root: String,

    /// Alternate root the relay storage is mounted under, if any.
    ///
    /// When the relay runs in a separate container its storage directory is
    /// often visible here under the same relative layout.
    pub mounted_media_root: Option<String>,

    /// Command template invoked to copy a relay file into a temp location
    /// when it cannot be read directly. `{src}` and `{dst}` are substituted
    /// with the source reference and the destination path.
    pub extract_command: Option<String>,
}

fn default_relay_root() -> String {
    "/var/lib/media-relay".to_string()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use media_uplink::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment (with a prefix of APP)
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Also add settings from environment variables directly (without prefix)
            // Note: Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Fallback: Check environment variables directly if config didn't pick them up
        if settings.mounted_media_root.is_none() {
            if let Ok(val) = std::env::var("MOUNTED_MEDIA_ROOT") {
                if !val.is_empty() {
                    settings.mounted_media_root = Some(val);
                }
            }
        }
        if settings.extract_command.is_none() {
            if let Ok(val) = std::env::var("EXTRACT_COMMAND") {
                if !val.is_empty() {
                    settings.extract_command = Some(val);
                }
            }
        }

        Ok(settings)
    }
}

/// HTTP timeout for backend requests, in seconds.
///
/// Reads `UPLOAD_HTTP_TIMEOUT_SECS`, defaulting to 90. Large chunk bodies
/// over slow links need a far longer budget than a JSON roundtrip.
#[must_use]
pub fn get_upload_http_timeout_secs() -> u64 {
    std::env::var("UPLOAD_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(90)
}

// Upload engine configuration
/// Fixed chunk size for resumable transfers (5 MiB)
pub const CHUNK_SIZE_BYTES: usize = 5 * 1024 * 1024;
/// Files at or below this size are sent as one multipart request (10 MiB)
pub const DIRECT_UPLOAD_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Attempt budget per chunk
pub const CHUNK_MAX_ATTEMPTS: u32 = 5;
/// Full-session restarts allowed after the initial session
pub const SESSION_MAX_RESTARTS: u32 = 3;
/// Initial retry backoff delay
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
/// Retry backoff ceiling
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
/// Jitter applied to every backoff delay (fraction of the delay)
pub const RETRY_JITTER_FRACTION: f64 = 0.25;

// Notification dedup configuration
/// TTL for grouped-media dedup entries (seconds)
pub const MEDIA_GROUP_TTL_SECS: u64 = 600;
/// Maximum tracked media groups
pub const MEDIA_GROUP_MAX_ENTRIES: u64 = 10_000;
