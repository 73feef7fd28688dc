//! Checked-out cache block handle

use super::{CacheBlock, PartitionedCache};
use crate::sleeve::EntrySleeve;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tuplespace_common::Oid;

/// A cache block held by one caller.
///
/// While a descriptor lives the block cannot be evicted. Dropping it (or
/// calling [`release`](Self::release)) gives the reference back and, if
/// the sleeve was marked dirty, hands it to the cache listener.
pub struct CacheBlockDescriptor<'a> {
    cache: &'a PartitionedCache,
    block: Arc<CacheBlock>,
    dirty: bool,
}

impl<'a> CacheBlockDescriptor<'a> {
    pub(crate) fn new(cache: &'a PartitionedCache, block: Arc<CacheBlock>) -> Self {
        Self {
            cache,
            block,
            dirty: false,
        }
    }

    pub fn oid(&self) -> Oid {
        self.block.oid()
    }

    /// Lock the sleeve. Do not hold the guard across calls back into the
    /// cache.
    pub fn sleeve(&self) -> MutexGuard<'_, EntrySleeve> {
        self.block.lock()
    }

    /// Schedule the sleeve's new state for disk on release
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn release(self) {}
}

impl Drop for CacheBlockDescriptor<'_> {
    fn drop(&mut self) {
        if self.dirty {
            self.cache.listener().dirtied(&self.block);
        }
        self.block.release();
    }
}

impl std::fmt::Debug for CacheBlockDescriptor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBlockDescriptor")
            .field("oid", &self.block.oid())
            .field("refs", &self.block.refs())
            .field("dirty", &self.dirty)
            .finish()
    }
}
