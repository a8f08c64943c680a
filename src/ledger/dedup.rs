use std::time::Duration;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use sha2::{Digest, Sha256};

use super::schema::messages;
use super::Role;
use crate::db::SqlitePooledConn;
use crate::error::{Result, VesperError};

pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 60;

/// Time-windowed suppression of identical `(conversation, role, content)`
/// inserts. This is not a uniqueness constraint: the same content is accepted
/// again once the window has passed.
#[derive(Debug, Clone, Copy)]
pub struct DedupGuard {
    window_millis: i64,
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window_millis: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis.max(0) as u64)
    }

    /// Returns `false` when an identical row was inserted within the window.
    /// Callers must hold the store's write gate so check and insert cannot
    /// interleave with another producer.
    pub(crate) async fn admits(
        &self,
        conn: &mut SqlitePooledConn<'_>,
        conversation_id: &str,
        role: Role,
        content: &str,
        fingerprint: &str,
        now: i64,
    ) -> Result<bool> {
        if self.window_millis <= 0 {
            return Ok(true);
        }
        let cutoff = now.saturating_sub(self.window_millis);
        let recent = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .filter(messages::role.eq(role.as_str()))
            .filter(messages::content_fingerprint.eq(fingerprint))
            .filter(messages::content.eq(content))
            .filter(messages::created_at.gt(cutoff))
            .select(messages::id)
            .first::<i32>(conn)
            .await
            .optional()
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(recent.is_none())
    }
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS))
    }
}

/// Whitespace-collapsed, lowercased content.
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 hex digest of the normalized content. Stable across processes.
pub fn content_fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(content).as_bytes());
    format!("{:x}", hasher.finalize())
}
