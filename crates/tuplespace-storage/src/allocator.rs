//! OID allocation
//!
//! Each zone hands out increasing ids from a block reserved on disk ahead
//! of use. After a restart a zone continues from its persisted limit, so
//! ids are never reused even if the previous run did not use its whole
//! block.

use crate::storage::Storage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use tuplespace_common::{Oid, Result};

const RESERVE_BLOCK: u64 = 1024;

struct Zone {
    next: u64,
    limit: u64,
}

pub struct OidAllocator {
    storage: Arc<Storage>,
    zones: Vec<Mutex<Zone>>,
    cursor: AtomicUsize,
}

impl OidAllocator {
    /// Allocator over `zones` zones, resuming from the persisted limits
    pub fn new(storage: Arc<Storage>, zones: u32) -> Result<Self> {
        let zones = (0..zones.max(1))
            .map(|z| {
                let limit = storage.oid_limit(z)?;
                Ok(Mutex::new(Zone { next: limit, limit }))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            storage,
            zones,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Next OID, rotating over the zones
    pub fn next(&self) -> Result<Oid> {
        let z = self.cursor.fetch_add(1, Ordering::Relaxed) % self.zones.len();
        let mut zone = self.zones[z].lock();
        if zone.next >= zone.limit {
            let limit = zone.next + RESERVE_BLOCK;
            self.storage.set_oid_limit(z as u32, limit)?;
            debug!(
                "{}: reserved zone {} ids up to {}",
                self.storage.type_name(),
                z,
                limit
            );
            zone.limit = limit;
        }
        let oid = Oid::new(z as u32, zone.next);
        zone.next += 1;
        Ok(oid)
    }

    pub fn zones(&self) -> usize {
        self.zones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::DirtyBuffer;
    use crate::disk::{Disk, MemoryDisk};
    use tuplespace_common::config::StorageConfig;
    use tuplespace_common::TypeName;

    fn storage(disk: Arc<dyn Disk>) -> Arc<Storage> {
        let storage = Storage::new(
            TypeName::from("Foo"),
            disk,
            &StorageConfig::default(),
            Arc::new(DirtyBuffer::new()),
        );
        storage.init(false).unwrap();
        Arc::new(storage)
    }

    #[test]
    fn test_single_zone_is_monotonic() {
        let alloc = OidAllocator::new(storage(Arc::new(MemoryDisk::new())), 1).unwrap();
        let oids: Vec<Oid> = (0..3000).map(|_| alloc.next().unwrap()).collect();
        assert!(oids.windows(2).all(|w| w[0] < w[1]));
        assert!(oids.iter().all(|o| o.zone() == 0));
    }

    #[test]
    fn test_zones_rotate() {
        let alloc = OidAllocator::new(storage(Arc::new(MemoryDisk::new())), 3).unwrap();
        let zones: Vec<u32> = (0..6).map(|_| alloc.next().unwrap().zone()).collect();
        assert_eq!(zones, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_restart_never_reuses_ids() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let last = {
            let alloc = OidAllocator::new(storage(Arc::clone(&disk)), 1).unwrap();
            (0..10).map(|_| alloc.next().unwrap()).last().unwrap()
        };

        let alloc = OidAllocator::new(storage(disk), 1).unwrap();
        let first = alloc.next().unwrap();
        assert!(first > last);
        assert_eq!(first.id(), RESERVE_BLOCK);
    }
}
