use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::ResponseCache;
use crate::error::Result;
use crate::interfaces::scheduler::ScheduledJob;

/// Periodic purge of entries older than the cache's default TTL. Reads are
/// already lazy about expiry; this only keeps the table from growing.
pub struct CacheSweepJob {
    cache: Arc<ResponseCache>,
    interval: Duration,
}

impl CacheSweepJob {
    pub fn new(cache: Arc<ResponseCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }
}

#[async_trait]
impl ScheduledJob for CacheSweepJob {
    fn name(&self) -> &str {
        "cache_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let purged = self
            .cache
            .purge_expired(self.cache.default_ttl_minutes())
            .await?;
        if purged > 0 {
            info!(purged, "expired cache entries removed");
        }
        Ok(())
    }
}
