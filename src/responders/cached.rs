use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::error::Result;
use crate::interfaces::generator::ResponseGenerator;
use crate::ledger::ContextTurn;

/// Serves repeated queries from the [`ResponseCache`] and only calls the
/// inner generator on a miss. Replies are keyed on the query text alone.
pub struct CachedGenerator {
    inner: Arc<dyn ResponseGenerator>,
    cache: Arc<ResponseCache>,
    ttl_minutes: u32,
}

impl CachedGenerator {
    pub fn new(inner: Arc<dyn ResponseGenerator>, cache: Arc<ResponseCache>) -> Self {
        let ttl_minutes = cache.default_ttl_minutes();
        Self {
            inner,
            cache,
            ttl_minutes,
        }
    }

    pub fn with_ttl_minutes(mut self, ttl_minutes: u32) -> Self {
        self.ttl_minutes = ttl_minutes;
        self
    }
}

#[async_trait]
impl ResponseGenerator for CachedGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn cacheable(&self, query: &str) -> bool {
        self.inner.cacheable(query)
    }

    async fn generate(
        &self,
        query: &str,
        context: &[ContextTurn],
        conversation_id: &str,
    ) -> Result<String> {
        let cacheable = self.inner.cacheable(query);
        if cacheable {
            if let Some(hit) = self.cache.get(query, self.ttl_minutes).await {
                debug!(tier = ?hit.tier, source = %hit.source, "reply served from cache");
                return Ok(hit.payload);
            }
        }

        let reply = self.inner.generate(query, context, conversation_id).await?;
        if cacheable && !reply.trim().is_empty() {
            if let Err(err) = self
                .cache
                .put_with_ttl(query, &reply, self.inner.name(), self.ttl_minutes)
                .await
            {
                warn!(error = %err, "could not cache generated reply");
            }
        }
        Ok(reply)
    }
}
