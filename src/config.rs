use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cache::{ResponseCacheConfig, DEFAULT_MEMORY_CAPACITY, DEFAULT_TTL_MINUTES};
use crate::error::{Result, VesperError};
use crate::ledger::{MessageStoreConfig, DEFAULT_DEDUP_WINDOW_SECS};
use crate::processor::{ChatProcessorConfig, ConcisePolicy, MarkPolicy};

pub const DEFAULT_POOL_SIZE: u32 = 8;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub sqlite_path: Option<String>,
    pub pool_size: Option<u32>,
    pub dedup_window_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessorSection {
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub context_limit: Option<usize>,
    pub mark_policy: Option<MarkPolicy>,
    pub max_attempts: Option<u32>,
    pub max_reply_lines: Option<usize>,
    pub max_reply_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheSection {
    pub memory_capacity: Option<usize>,
    pub default_ttl_minutes: Option<u32>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub processor: Option<ProcessorSection>,
    pub cache: Option<CacheSection>,
}

impl Config {
    pub fn convention_defaults(db_path: &str) -> Self {
        Self {
            database: DatabaseConfig {
                sqlite_path: Some(db_path.to_string()),
                pool_size: Some(DEFAULT_POOL_SIZE),
                dedup_window_secs: Some(DEFAULT_DEDUP_WINDOW_SECS),
            },
            processor: Some(ProcessorSection {
                poll_interval_ms: Some(1_000),
                batch_size: Some(5),
                context_limit: Some(5),
                mark_policy: Some(MarkPolicy::BeforeGenerate),
                max_attempts: Some(3),
                max_reply_lines: Some(4),
                max_reply_chars: Some(200),
            }),
            cache: Some(CacheSection {
                memory_capacity: Some(DEFAULT_MEMORY_CAPACITY),
                default_ttl_minutes: Some(DEFAULT_TTL_MINUTES),
                sweep_interval_secs: Some(DEFAULT_SWEEP_INTERVAL_SECS),
            }),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            VesperError::Config(format!("failed to read {}: {e}", path.to_string_lossy()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| VesperError::Config(e.to_string()))
    }

    /// Loads `path` when it exists, otherwise falls back to defaults rooted at
    /// `db_path`. An explicit `db_path` always wins over the file's value.
    pub fn load_or_defaults(path: impl AsRef<Path>, db_path: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::convention_defaults(&crate::runtime_paths::default_db_path())
        };
        if let Some(db_path) = db_path {
            config.database.sqlite_path = Some(db_path.to_string());
        }
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| VesperError::Config(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| VesperError::Serialization(e.to_string()))?;
        fs::write(path, raw).map_err(|e| VesperError::Config(e.to_string()))
    }

    pub fn sqlite_path(&self) -> String {
        self.database
            .sqlite_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(crate::runtime_paths::default_db_path)
    }

    pub fn store_config(&self) -> MessageStoreConfig {
        let mut store = MessageStoreConfig::new(self.sqlite_path());
        if let Some(size) = self.database.pool_size {
            store.pool_size = size.max(1);
        }
        if let Some(secs) = self.database.dedup_window_secs {
            store.dedup_window = Duration::from_secs(secs);
        }
        store
    }

    pub fn cache_config(&self) -> ResponseCacheConfig {
        let mut cache = ResponseCacheConfig::new(self.sqlite_path());
        if let Some(size) = self.database.pool_size {
            cache.pool_size = size.max(1);
        }
        if let Some(section) = &self.cache {
            if let Some(capacity) = section.memory_capacity {
                cache.memory_capacity = capacity.max(1);
            }
            if let Some(ttl) = section.default_ttl_minutes {
                cache.default_ttl_minutes = ttl;
            }
        }
        cache
    }

    pub fn processor_config(&self) -> ChatProcessorConfig {
        let mut processor = ChatProcessorConfig::default();
        let Some(section) = &self.processor else {
            return processor;
        };
        if let Some(ms) = section.poll_interval_ms {
            processor.poll_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(batch) = section.batch_size {
            processor.batch_size = batch.max(1);
        }
        if let Some(limit) = section.context_limit {
            processor.context_limit = limit;
        }
        if let Some(policy) = section.mark_policy {
            processor.mark_policy = policy;
        }
        if let Some(attempts) = section.max_attempts {
            processor.max_attempts = attempts.max(1);
        }
        let defaults = ConcisePolicy::default();
        processor.concise = ConcisePolicy {
            max_lines: section.max_reply_lines.unwrap_or(defaults.max_lines),
            max_chars: section.max_reply_chars.unwrap_or(defaults.max_chars),
        };
        processor
    }

    /// `None` disables the periodic cache sweep.
    pub fn sweep_interval(&self) -> Option<Duration> {
        let secs = self
            .cache
            .as_ref()
            .and_then(|section| section.sweep_interval_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}
