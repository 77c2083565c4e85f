use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::harness::HarnessConfig;
use crate::storage::StorageType;

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub storage_type: StorageType,
    pub data_dir: String,

    pub cache: CacheOptions,
    pub harness: HarnessConfig,
}

impl Config {
    pub fn new(file: &str) -> Result<Config> {
        let defaults = CacheOptions::default();
        let mut cfg = config::Config::builder()
            .set_default("log_level", "info")?
            .set_default("storage_type", "memory")?
            .set_default("data_dir", "data")?
            .set_default("cache.max_cached_pages", defaults.max_cached_pages as i64)?
            .set_default("cache.page_size", defaults.page_size as i64)?
            .set_default("harness.concurrency", 4)?
            .set_default("harness.commands_per_thread", 1000)?;
        if !file.is_empty() {
            cfg = cfg.add_source(config::File::with_name(file))
        }
        cfg = cfg.add_source(config::Environment::with_prefix("PAGECACHE").separator("__"));
        Ok(cfg.build()?.try_deserialize()?)
    }
}

/// What to do when the last mapping of a file is released while cursors on
/// it are still open.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmapPolicy {
    /// Wait for the cursors to close, up to `unmap_timeout_ms`.
    Block,
    /// Fail right away with `Error::FileInUse`.
    Fail,
}

/// Tunables of a page cache instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub max_cached_pages: usize,
    pub page_size: usize,
    /// Run the background evictor thread.
    pub background_eviction: bool,
    /// Number of frames the background evictor keeps on the free list, zero
    /// picks a value derived from the cache size.
    pub keep_free: usize,
    /// How long a page fault waits for a frame before giving up.
    pub eviction_timeout_ms: u64,
    /// How many full clock revolutions one eviction attempt may make.
    pub clock_sweeps: usize,
    /// Upper bound on waiting for a page lock, zero waits forever.
    pub lock_timeout_ms: u64,
    pub unmap_policy: UnmapPolicy,
    pub unmap_timeout_ms: u64,
    /// Retries of a page read that failed transiently.
    pub io_retries: usize,
    /// Read every written page back and compare.
    pub verify_writes: bool,
    pub flush_retry_interval_ms: u64,
    pub flush_retry_limit: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_cached_pages: 1024,
            page_size: 8192,
            background_eviction: true,
            keep_free: 0,
            eviction_timeout_ms: 10_000,
            clock_sweeps: 2,
            lock_timeout_ms: 0,
            unmap_policy: UnmapPolicy::Block,
            unmap_timeout_ms: 10_000,
            io_retries: 3,
            verify_writes: false,
            flush_retry_interval_ms: 100,
            flush_retry_limit: 10,
        }
    }
}

impl CacheOptions {
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn unmap_timeout(&self) -> Duration {
        Duration::from_millis(self.unmap_timeout_ms)
    }

    pub fn flush_retry_interval(&self) -> Duration {
        Duration::from_millis(self.flush_retry_interval_ms)
    }

    /// Frames the background evictor keeps free: the configured value, or
    /// 5% of the cache but at least min(capacity / 2, 30).
    pub fn pages_to_keep_free(&self, max_pages: usize) -> usize {
        if !self.background_eviction {
            return 0;
        }
        if self.keep_free > 0 {
            return self.keep_free.min(max_pages / 2);
        }
        let lower_bound = (max_pages / 2).min(30);
        lower_bound.max((max_pages / 20).min(100_000))
    }
}
