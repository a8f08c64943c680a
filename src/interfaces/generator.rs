use async_trait::async_trait;

use crate::error::Result;
use crate::ledger::ContextTurn;

/// Produces a reply for one user message. Implementations may block for as
/// long as they need; the processor enforces no timeout.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    fn name(&self) -> &str {
        "generator"
    }

    /// Whether a reply to `query` may be served from the response cache.
    /// Time-dependent answers should opt out.
    fn cacheable(&self, _query: &str) -> bool {
        true
    }

    async fn generate(
        &self,
        query: &str,
        context: &[ContextTurn],
        conversation_id: &str,
    ) -> Result<String>;
}
