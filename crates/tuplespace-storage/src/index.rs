//! Secondary hash index over one field
//!
//! Keys are the field's 4-byte big-endian hash code, values the encoded OIDs
//! of every entry whose field hashes to it. Null fields are not indexed.

use crate::codec::MangledEntry;
use crate::disk::{retrying_update, Cursor, Disk, DiskResult, DiskTxn, RetryPolicy, TxnMode};
use crate::locator::CursorLocator;
use std::sync::Arc;
use tracing::{debug, error};
use tuplespace_common::{Oid, Result};

/// Index over the field at `offset`
pub struct KeyIndex {
    disk: Arc<dyn Disk>,
    table: String,
    offset: usize,
    policy: RetryPolicy,
    page_size: usize,
}

impl KeyIndex {
    pub fn new(
        disk: Arc<dyn Disk>,
        table: String,
        offset: usize,
        policy: RetryPolicy,
        page_size: usize,
    ) -> Self {
        Self {
            disk,
            table,
            offset,
            policy,
            page_size,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Add `oid` under this index's field of `entry`, inside the caller's
    /// transaction
    pub fn index(&self, txn: &mut dyn DiskTxn, oid: Oid, entry: &MangledEntry) -> DiskResult<()> {
        let Some(hash) = entry.field_hash(self.offset) else {
            return Ok(());
        };
        txn.put_dup(&self.table, &hash.to_be_bytes(), &oid.to_bytes())
    }

    /// Remove `oid` from this index.
    ///
    /// Runs in its own short transactions, retried on contention. A missing
    /// pair is logged and tolerated.
    pub fn unindex(&self, oid: Oid, entry: &MangledEntry) -> Result<()> {
        let Some(hash) = entry.field_hash(self.offset) else {
            return Ok(());
        };
        let key = hash.to_be_bytes();
        let value = oid.to_bytes();

        let what = format!("unindex {} from {}", oid, self.table);
        let found = retrying_update(self.disk.as_ref(), &self.policy, &what, |txn| {
            txn.delete_dup(&self.table, &key, &value)
        })
        .map_err(|e| e.context(what.clone()))?;

        if !found {
            error!(
                "Index {} has no entry for {} under hash {:08x}",
                self.table, oid, hash
            );
        }
        Ok(())
    }

    /// Number of OIDs stored under `hash`
    pub fn count(&self, hash: u32) -> Result<u64> {
        let txn = self.disk.begin(TxnMode::ReadOnly)?;
        let count = txn.count_dup(&self.table, &hash.to_be_bytes())?;
        txn.abort()?;
        debug!("Lookup {} hash {:08x}: {} hits", self.table, hash, count);
        Ok(count)
    }

    /// Ascending cursor over the OIDs stored under `hash`
    pub fn new_cursor(&self, hash: u32) -> CursorLocator {
        CursorLocator::new(Cursor::dup(
            Arc::clone(&self.disk),
            self.table.clone(),
            &hash.to_be_bytes(),
            self.page_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;
    use crate::locator::collect;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::from_micros(100),
            max_delay: Duration::from_millis(1),
        }
    }

    fn setup() -> (Arc<MemoryDisk>, KeyIndex) {
        let disk = Arc::new(MemoryDisk::new());
        let index = KeyIndex::new(disk.clone(), "Foo.idx.0".into(), 0, policy(), 16);
        (disk, index)
    }

    fn add(disk: &MemoryDisk, index: &KeyIndex, id: u64, entry: &MangledEntry) {
        let mut txn = disk.begin(TxnMode::Write).unwrap();
        index.index(txn.as_mut(), Oid::new(0, id), entry).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_index_and_scan() {
        let (disk, index) = setup();
        let one = MangledEntry::new("Foo").with("a", 1i64);
        let two = MangledEntry::new("Foo").with("a", 2i64);
        add(&disk, &index, 1, &one);
        add(&disk, &index, 2, &two);
        add(&disk, &index, 3, &one);

        let hash = one.field_hash(0).unwrap();
        assert_eq!(index.count(hash).unwrap(), 2);
        let found = collect(&mut index.new_cursor(hash)).unwrap();
        assert_eq!(found, vec![Oid::new(0, 1), Oid::new(0, 3)]);
    }

    #[test]
    fn test_null_field_not_indexed() {
        let (disk, index) = setup();
        let null = MangledEntry::new("Foo").with_null("a");
        add(&disk, &index, 1, &null);

        let txn = disk.begin(TxnMode::ReadOnly).unwrap();
        assert_eq!(txn.scan_dup("Foo.idx.0", &0u32.to_be_bytes(), None, 10).unwrap().len(), 0);
        drop(txn);
        index.unindex(Oid::new(0, 1), &null).unwrap();
    }

    #[test]
    fn test_unindex_removes_exact_pair() {
        let (disk, index) = setup();
        let one = MangledEntry::new("Foo").with("a", 1i64);
        add(&disk, &index, 1, &one);
        add(&disk, &index, 2, &one);

        index.unindex(Oid::new(0, 1), &one).unwrap();
        let hash = one.field_hash(0).unwrap();
        assert_eq!(collect(&mut index.new_cursor(hash)).unwrap(), vec![Oid::new(0, 2)]);

        // Missing pair is tolerated
        index.unindex(Oid::new(0, 1), &one).unwrap();
    }

    #[test]
    fn test_concurrent_unindex_under_contention() {
        let (disk, index) = setup();
        let index = Arc::new(index);
        let one = MangledEntry::new("Foo").with("a", 1i64);
        for id in 0..8 {
            add(&disk, &index, id, &one);
        }

        disk.inject_contention(20);
        let handles: Vec<_> = (0..8)
            .map(|id| {
                let index = Arc::clone(&index);
                let entry = one.clone();
                std::thread::spawn(move || index.unindex(Oid::new(0, id), &entry))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(disk.pending_contention(), 0);
        assert_eq!(index.count(one.field_hash(0).unwrap()).unwrap(), 0);
    }
}
