//! Per-type operation counters

use crate::cache::CacheStatsSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    instances: AtomicI64,
    writes: AtomicU64,
    takes: AtomicU64,
    reads: AtomicU64,
    purges: AtomicU64,
}

/// Point-in-time copy of a type's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub instances: i64,
    pub writes: u64,
    pub takes: u64,
    pub reads: u64,
    pub purges: u64,
    pub pending_flushes: usize,
    /// Flushes that exhausted their attempts and were parked
    pub failed_flushes: u64,
    pub cache: CacheStatsSnapshot,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_take(&self) {
        self.takes.fetch_add(1, Ordering::Relaxed);
        self.instances.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// An expired or cancelled entry was purged
    pub fn on_purge(&self) {
        self.purges.fetch_add(1, Ordering::Relaxed);
        self.instances.fetch_sub(1, Ordering::Relaxed);
    }

    /// Entries removed outside take or purge
    pub fn on_removed(&self, n: usize) {
        self.instances.fetch_sub(n as i64, Ordering::Relaxed);
    }

    /// Entries found on disk at startup
    pub fn on_loaded(&self) {
        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instances(&self) -> i64 {
        self.instances.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        pending_flushes: usize,
        failed_flushes: u64,
        cache: CacheStatsSnapshot,
    ) -> CounterSnapshot {
        CounterSnapshot {
            instances: self.instances(),
            writes: self.writes.load(Ordering::Relaxed),
            takes: self.takes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            pending_flushes,
            failed_flushes,
            cache,
        }
    }
}
