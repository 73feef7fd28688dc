//! Partitioned sleeve cache
//!
//! OIDs hash to one of a power-of-two number of [`ArcCache`] partitions, so
//! unrelated lookups rarely contend on the same lock. Callers get a
//! [`CacheBlockDescriptor`] that keeps the block resident until released.

mod arc;
mod descriptor;

pub use arc::{ArcCache, ArcDebugInfo, CacheBlock, CacheStats};
pub use descriptor::CacheBlockDescriptor;

use crate::dirty::FlushKind;
use crate::sleeve::EntrySleeve;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;
use tuplespace_common::config::CacheConfig;
use tuplespace_common::{Oid, Result};

/// Hooks the cache calls as sleeves move between memory and disk
pub trait CacheListener: Send + Sync {
    /// A sleeve was brought into the cache by a loader
    fn loaded(&self, _sleeve: &EntrySleeve) {}

    /// A dirty descriptor was released. Called without any cache lock held.
    fn dirtied(&self, block: &CacheBlock);

    /// The latest state of `oid` reached disk
    fn flushed(&self, _oid: Oid, _kind: FlushKind) {}

    /// Push pending work for `oid` to disk now
    fn force(&self, oid: Oid) -> Result<()>;

    /// Push all pending work to disk
    fn sync(&self) -> Result<()>;
}

/// What [`PartitionedCache::recover`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    /// A durable or pending copy already existed, nothing to replay
    pub on_disk: bool,
    /// The OID was already resident
    pub cached: bool,
}

/// Aggregated statistics over all partitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
}

pub struct PartitionedCache {
    parts: Vec<ArcCache>,
    mask: usize,
    listener: Arc<dyn CacheListener>,
}

impl PartitionedCache {
    pub fn new(config: &CacheConfig, listener: Arc<dyn CacheListener>) -> Self {
        let partitions = config.partitions();
        let capacity = config.partition_capacity();
        debug!(
            "Sleeve cache: {} partitions of {} blocks",
            partitions, capacity
        );
        Self {
            parts: (0..partitions).map(|_| ArcCache::new(capacity)).collect(),
            mask: partitions - 1,
            listener,
        }
    }

    fn part(&self, oid: &Oid) -> &ArcCache {
        &self.parts[oid.partition_hash() as usize & self.mask]
    }

    pub(crate) fn listener(&self) -> &dyn CacheListener {
        self.listener.as_ref()
    }

    /// Make a new sleeve resident
    pub fn insert(&self, sleeve: EntrySleeve) -> CacheBlockDescriptor<'_> {
        let block = Arc::new(CacheBlock::new(sleeve));
        let block = self.part(&block.oid()).put(block);
        CacheBlockDescriptor::new(self, block)
    }

    /// Resident sleeve for `oid`, or whatever `loader` produces for it.
    ///
    /// The loader runs without any partition lock held. If another caller
    /// made the OID resident meanwhile, its block wins. If blocks left the
    /// partition while loading, the loaded state is checked again so a copy
    /// of an entry deleted and evicted in between cannot come back.
    pub fn find(
        &self,
        oid: Oid,
        loader: impl Fn(Oid) -> Result<Option<EntrySleeve>>,
    ) -> Result<Option<CacheBlockDescriptor<'_>>> {
        let part = self.part(&oid);
        if let Some(block) = part.get(&oid) {
            return Ok(Some(CacheBlockDescriptor::new(self, block)));
        }

        let ticket = part.ticket();
        let Some(sleeve) = loader(oid)? else {
            return Ok(None);
        };
        self.listener.loaded(&sleeve);
        let (block, stale) = part.put_loaded(Arc::new(CacheBlock::new(sleeve)), ticket);
        let cbd = CacheBlockDescriptor::new(self, block);

        if stale {
            let current = loader(oid)?;
            let mut sleeve = cbd.sleeve();
            match current {
                Some(current) if !sleeve.is_deleted() => *sleeve = current,
                Some(_) => {}
                None => {
                    debug!("{} vanished while loading", oid);
                    sleeve.set_deleted();
                }
            }
        }
        Ok(Some(cbd))
    }

    /// Bring a replayed sleeve back. A resident or loadable copy of the OID
    /// takes precedence over the replayed one.
    pub fn recover(
        &self,
        sleeve: EntrySleeve,
        loader: impl FnOnce(Oid) -> Result<Option<EntrySleeve>>,
    ) -> Result<(CacheBlockDescriptor<'_>, RecoverySummary)> {
        let oid = sleeve.oid();
        let part = self.part(&oid);

        if let Some(block) = part.peek(&oid) {
            let on_disk = block.lock().is_on_disk();
            let summary = RecoverySummary { on_disk, cached: true };
            return Ok((CacheBlockDescriptor::new(self, block), summary));
        }

        let (sleeve, on_disk) = match loader(oid)? {
            Some(existing) => (existing, true),
            None => (sleeve, false),
        };
        let block = part.put(Arc::new(CacheBlock::new(sleeve)));
        let summary = RecoverySummary {
            on_disk,
            cached: false,
        };
        Ok((CacheBlockDescriptor::new(self, block), summary))
    }

    /// Push the descriptor's pending work to disk now. The sleeve must not
    /// be locked by the caller.
    pub fn force_sync(&self, descriptor: &CacheBlockDescriptor<'_>) -> Result<()> {
        self.listener.force(descriptor.oid())
    }

    /// Push all pending work to disk
    pub fn sync(&self) -> Result<()> {
        self.listener.sync()
    }

    /// Record that the latest state of `oid` is durable. A deleted block
    /// nobody holds leaves the cache.
    pub fn flushed(&self, oid: Oid, kind: FlushKind) {
        let part = self.part(&oid);
        if let Some(block) = part.peek(&oid) {
            let deleted = {
                let mut sleeve = block.lock();
                if kind != FlushKind::Delete {
                    sleeve.set_on_disk();
                }
                sleeve.is_deleted()
            };
            block.release();
            if deleted && part.remove_if_idle(&oid) {
                debug!("Evicted deleted {}", oid);
            }
        }
        self.listener.flushed(oid, kind);
    }

    /// Drop a block regardless of references
    pub fn evict(&self, oid: Oid) -> bool {
        self.part(&oid).remove(&oid).is_some()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.part(&oid).contains(&oid)
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(ArcCache::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partitions(&self) -> usize {
        self.parts.len()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.parts
            .iter()
            .fold(CacheStatsSnapshot::default(), |mut acc, part| {
                let stats = part.stats();
                acc.hits += stats.hits.load(Ordering::Relaxed);
                acc.misses += stats.misses.load(Ordering::Relaxed);
                acc.evictions += stats.evictions.load(Ordering::Relaxed);
                acc.resident += part.len();
                acc
            })
    }
}
