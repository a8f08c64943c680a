//! Two-tier TTL cache for expensive lookups (search results, generated
//! replies).
//!
//! The durable tier is a `search_cache` table keyed by a stable SHA-256 of
//! the normalized query, so entries survive restarts. The memory tier is a
//! bounded map that absorbs repeats within one process. Freshness is checked
//! lazily on read; [`ResponseCache::purge_expired`] is an optional sweep.

use std::sync::Arc;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::{minutes_to_millis, Clock, SystemClock};
use crate::db::{SqlitePool, SqlitePooledConn};
use crate::error::{Result, VesperError};

mod memory;
mod schema;
mod sweep;

use memory::{MemoryEntry, MemoryTier};
use schema::search_cache;
pub use sweep::CacheSweepJob;

pub const DEFAULT_MEMORY_CAPACITY: usize = 50;
pub const DEFAULT_TTL_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Durable,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheHit {
    pub raw_query: String,
    pub payload: String,
    pub source: String,
    pub written_at: i64,
    pub tier: CacheTier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size_in_memory: usize,
    pub total_durable: i64,
    pub fresh_durable: i64,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
}

#[derive(Queryable)]
struct CacheRow {
    #[allow(dead_code)]
    key: String,
    raw_query: String,
    payload: String,
    source: String,
    written_at: i64,
    #[allow(dead_code)]
    ttl_minutes: i32,
}

#[derive(Insertable)]
#[diesel(table_name = search_cache)]
struct NewCacheRow<'a> {
    key: &'a str,
    raw_query: &'a str,
    payload: &'a str,
    source: &'a str,
    written_at: i64,
    ttl_minutes: i32,
}

#[derive(Clone)]
pub struct ResponseCacheConfig {
    pub sqlite_path: String,
    pub pool_size: u32,
    pub memory_capacity: usize,
    pub default_ttl_minutes: u32,
    pub clock: Arc<dyn Clock>,
}

impl ResponseCacheConfig {
    pub fn new(sqlite_path: impl Into<String>) -> Self {
        Self {
            sqlite_path: sqlite_path.into(),
            pool_size: crate::config::DEFAULT_POOL_SIZE,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }
}

pub struct ResponseCache {
    pool: SqlitePool,
    memory: tokio::sync::Mutex<MemoryTier>,
    default_ttl_minutes: u32,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        Self::open(ResponseCacheConfig::new(sqlite_path.as_ref())).await
    }

    pub async fn open(config: ResponseCacheConfig) -> Result<Self> {
        crate::db::prepare_database(&config.sqlite_path).await?;
        let pool = crate::db::build_pool(&config.sqlite_path, config.pool_size).await?;
        Ok(Self {
            pool,
            memory: tokio::sync::Mutex::new(MemoryTier::new(config.memory_capacity)),
            default_ttl_minutes: config.default_ttl_minutes,
            clock: config.clock,
        })
    }

    pub fn default_ttl_minutes(&self) -> u32 {
        self.default_ttl_minutes
    }

    /// Looks `query` up in the durable tier, then the memory tier. An entry is
    /// a hit while `now - written_at < ttl_minutes`. Durable read failures are
    /// logged and fall through to the memory tier.
    pub async fn get(&self, query: &str, ttl_minutes: u32) -> Option<CacheHit> {
        let key = cache_key(query);
        let now = self.clock.now_millis();
        let ttl_millis = minutes_to_millis(ttl_minutes);

        match self.read_durable(&key).await {
            Ok(Some(row)) if now - row.written_at < ttl_millis => {
                debug!(key = %key, "durable cache hit");
                return Some(CacheHit {
                    raw_query: row.raw_query,
                    payload: row.payload,
                    source: row.source,
                    written_at: row.written_at,
                    tier: CacheTier::Durable,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(key = %key, error = %err, "durable cache read failed"),
        }

        let mut memory = self.memory.lock().await;
        memory.get_fresh(&key, now, ttl_millis).map(|entry| {
            debug!(key = %key, "memory cache hit");
            CacheHit {
                raw_query: entry.raw_query,
                payload: entry.payload,
                source: entry.source,
                written_at: entry.written_at,
                tier: CacheTier::Memory,
            }
        })
    }

    pub async fn put(&self, query: &str, payload: &str, source: &str) -> Result<()> {
        self.put_with_ttl(query, payload, source, self.default_ttl_minutes)
            .await
    }

    /// Upserts the durable row for `query` and mirrors the entry into the
    /// memory tier. The memory write happens even when the durable write
    /// fails; the durable error is still returned.
    pub async fn put_with_ttl(
        &self,
        query: &str,
        payload: &str,
        source: &str,
        ttl_minutes: u32,
    ) -> Result<()> {
        let key = cache_key(query);
        let now = self.clock.now_millis();

        {
            let mut memory = self.memory.lock().await;
            let evicted = memory.insert(
                key.clone(),
                MemoryEntry {
                    raw_query: query.to_string(),
                    payload: payload.to_string(),
                    source: source.to_string(),
                    written_at: now,
                },
            );
            if let Some(evicted) = evicted {
                debug!(evicted = %evicted, "memory cache full; evicted oldest entry");
            }
        }

        let ttl = i32::try_from(ttl_minutes).unwrap_or(i32::MAX);
        let row = NewCacheRow {
            key: &key,
            raw_query: query,
            payload,
            source,
            written_at: now,
            ttl_minutes: ttl,
        };
        let mut conn = self.conn().await?;
        diesel::insert_into(search_cache::table)
            .values(&row)
            .on_conflict(search_cache::key)
            .do_update()
            .set((
                search_cache::raw_query.eq(query),
                search_cache::payload.eq(payload),
                search_cache::source.eq(source),
                search_cache::written_at.eq(now),
                search_cache::ttl_minutes.eq(ttl),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, query: &str, ttl_minutes: u32) -> Option<T> {
        let hit = self.get(query, ttl_minutes).await?;
        match serde_json::from_str(&hit.payload) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "cached payload is not valid json; ignoring");
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, query: &str, value: &T, source: &str) -> Result<()> {
        let payload =
            serde_json::to_string(value).map_err(|e| VesperError::Serialization(e.to_string()))?;
        self.put(query, &payload, source).await
    }

    /// Removes every entry from both tiers. Returns the number of durable
    /// rows deleted.
    pub async fn clear(&self) -> Result<usize> {
        let cleared = self.memory.lock().await.clear();
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(search_cache::table)
            .execute(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        debug!(durable = deleted, memory = cleared, "cache cleared");
        Ok(deleted)
    }

    /// Drops entries older than `ttl_minutes` from both tiers. With a TTL of
    /// zero this empties the cache.
    pub async fn purge_expired(&self, ttl_minutes: u32) -> Result<usize> {
        let now = self.clock.now_millis();
        let ttl_millis = minutes_to_millis(ttl_minutes);
        self.memory.lock().await.retain_fresh(now, ttl_millis);

        let mut conn = self.conn().await?;
        diesel::delete(search_cache::table.filter(search_cache::written_at.le(now - ttl_millis)))
            .execute(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))
    }

    /// Fresh counts use the cache's default TTL.
    pub async fn stats(&self) -> Result<CacheStats> {
        let size_in_memory = self.memory.lock().await.len();
        let now = self.clock.now_millis();
        let cutoff = now - minutes_to_millis(self.default_ttl_minutes);

        let mut conn = self.conn().await?;
        let total_durable = search_cache::table
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let fresh_durable = search_cache::table
            .filter(search_cache::written_at.gt(cutoff))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let oldest_entry = search_cache::table
            .select(diesel::dsl::min(search_cache::written_at))
            .first::<Option<i64>>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let newest_entry = search_cache::table
            .select(diesel::dsl::max(search_cache::written_at))
            .first::<Option<i64>>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;

        Ok(CacheStats {
            size_in_memory,
            total_durable,
            fresh_durable,
            oldest_entry,
            newest_entry,
        })
    }

    /// Whether the memory tier currently holds `query`, fresh or not.
    pub async fn in_memory(&self, query: &str) -> bool {
        self.memory.lock().await.contains(&cache_key(query))
    }

    async fn read_durable(&self, key: &str) -> Result<Option<CacheRow>> {
        let mut conn = self.conn().await?;
        search_cache::table
            .find(key)
            .first::<CacheRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| VesperError::Storage(e.to_string()))
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        crate::db::checkout(&self.pool).await
    }
}

/// Trimmed, case-folded query text.
pub fn normalize_key(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Persisted key: SHA-256 hex of the normalized query, identical across runs.
pub fn cache_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_key(query).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// TTL for search-style lookups by recency filter: results for "day" and
/// "week" queries change slowly and may be cached longer.
pub fn ttl_for_time_filter(filter: &str) -> u32 {
    match filter.trim().to_ascii_lowercase().as_str() {
        "day" => 1_440,
        "week" => 10_080,
        _ => DEFAULT_TTL_MINUTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized_before_hashing() {
        assert_eq!(cache_key("  Weather Today "), cache_key("weather today"));
        assert_ne!(cache_key("weather today"), cache_key("weather tomorrow"));
        assert_eq!(normalize_key("  MiXeD "), "mixed");
    }

    #[test]
    fn time_filters_map_to_ttls() {
        assert_eq!(ttl_for_time_filter("recent"), 30);
        assert_eq!(ttl_for_time_filter("Day"), 1_440);
        assert_eq!(ttl_for_time_filter("week"), 10_080);
        assert_eq!(ttl_for_time_filter("anything"), 30);
    }
}
