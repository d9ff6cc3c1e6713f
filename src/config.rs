//! Runtime configuration.
//!
//! Configuration is plain serde data and can be read from TOML or JSON.
//! Every field has a default, so partial files are accepted:
//!
//! ```toml
//! [cache]
//! memory_capacity = 134217728
//! memory_threshold = 0.8
//!
//! [scheduler]
//! parallelism = 4
//! ```

use crate::core::error::{ConfigError, ConfigResult};
use crate::execution::cache::{DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Tile cache settings.
    pub cache: CacheConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
}

/// Tile cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether images created by a session cache their tiles.
    pub enabled: bool,
    /// Capacity in bytes.
    pub memory_capacity: u64,
    /// Fraction of the capacity kept after an eviction pass.
    pub memory_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Threads computing tiles.
    pub parallelism: usize,
    /// Threads serving prefetch requests. Zero disables prefetching.
    pub prefetch_parallelism: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            parallelism,
            prefetch_parallelism: 1,
            thread_name_prefix: "tessera-tile".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Set the number of compute threads.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the number of prefetch threads.
    pub fn with_prefetch_parallelism(mut self, prefetch_parallelism: usize) -> Self {
        self.prefetch_parallelism = prefetch_parallelism;
        self
    }
}

impl CacheConfig {
    /// Enable or disable tile caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the capacity in bytes.
    pub fn with_memory_capacity(mut self, memory_capacity: u64) -> Self {
        self.memory_capacity = memory_capacity;
        self
    }

    /// Set the eviction threshold.
    pub fn with_memory_threshold(mut self, memory_threshold: f32) -> Self {
        self.memory_threshold = memory_threshold;
        self
    }
}

impl TesseraConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache section.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the scheduler section.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON.
    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.cache.memory_threshold) {
            return Err(ConfigError::Invalid {
                field: "cache.memory_threshold",
                reason: format!("{} is not within 0.0..=1.0", self.cache.memory_threshold),
            });
        }
        if self.scheduler.parallelism == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.parallelism",
                reason: "at least one compute thread is required".to_string(),
            });
        }
        Ok(())
    }
}
