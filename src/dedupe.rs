//! Grouped-media notification dedup.
//!
//! A multi-file message arrives as several updates sharing one group id;
//! only the first should trigger a notification. Entries expire on a TTL
//! and the cache is capacity-bounded, so there is no global map to sweep
//! by hand.

use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::config::{MEDIA_GROUP_MAX_ENTRIES, MEDIA_GROUP_TTL_SECS};

/// Time-bounded cache of recently seen media group ids.
#[derive(Clone)]
pub struct MediaGroupCache {
    cache: Cache<String, ()>,
}

impl Default for MediaGroupCache {
    fn default() -> Self {
        Self::new(MEDIA_GROUP_TTL_SECS, MEDIA_GROUP_MAX_ENTRIES)
    }
}

impl MediaGroupCache {
    /// Create a cache with the given TTL and capacity bound.
    #[must_use]
    pub fn new(ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        Self { cache }
    }

    /// Whether this group id was recorded within the TTL window.
    pub async fn seen(&self, group_id: &str) -> bool {
        self.cache.get(group_id).await.is_some()
    }

    /// Record a group id, starting its TTL window.
    pub async fn record(&self, group_id: &str) {
        debug!(group_id, "media group recorded");
        self.cache.insert(group_id.to_string(), ()).await;
    }
}
