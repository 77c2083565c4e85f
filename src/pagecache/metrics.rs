use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters the cache maintains for operational tooling. All counters are
/// monotonic for the lifetime of the cache.
#[derive(Debug, Default)]
pub struct Metrics {
    faults: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
    eviction_failures: AtomicU64,
    flushes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// A point-in-time copy of the cache metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub faults: u64,
    pub hits: u64,
    pub evictions: u64,
    pub eviction_failures: u64,
    /// pages written back to their files, by eviction or flush.
    pub flushes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Metrics {
    pub fn fault(&self, bytes: usize) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction_failure(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self, bytes: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl Display for MetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "faults={} hits={} evictions={} eviction_failures={} flushes={} bytes_read={} bytes_written={}",
            self.faults,
            self.hits,
            self.evictions,
            self.eviction_failures,
            self.flushes,
            self.bytes_read,
            self.bytes_written
        )
    }
}
