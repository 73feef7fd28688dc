//! Tuple locators: streams of candidate OIDs for a search
//!
//! A locator may yield OIDs whose entries do not match (hash collisions,
//! deleted or expired entries); the consumer loads and checks each one.

use crate::disk::Cursor;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tuplespace_common::{Error, Oid, Result};

/// Cursor-like source of candidate OIDs, ascending within one locator
pub trait TupleLocator: Send {
    /// Next candidate, `None` once exhausted
    fn next_oid(&mut self) -> Result<Option<Oid>>;
}

pub type BoxedLocator = Box<dyn TupleLocator>;

/// Locator over an in-memory snapshot of OIDs
pub struct VecLocator {
    oids: std::vec::IntoIter<Oid>,
}

impl VecLocator {
    /// Sorts and deduplicates the snapshot
    pub fn new(mut oids: Vec<Oid>) -> Self {
        oids.sort_unstable();
        oids.dedup();
        Self {
            oids: oids.into_iter(),
        }
    }
}

impl TupleLocator for VecLocator {
    fn next_oid(&mut self) -> Result<Option<Oid>> {
        Ok(self.oids.next())
    }
}

/// Locator over a disk cursor whose items are encoded OIDs
pub struct CursorLocator {
    cursor: Cursor,
}

impl CursorLocator {
    pub const fn new(cursor: Cursor) -> Self {
        Self { cursor }
    }
}

impl TupleLocator for CursorLocator {
    fn next_oid(&mut self) -> Result<Option<Oid>> {
        match self.cursor.next() {
            None => Ok(None),
            Some(Err(e)) => Err(e.context("cursor scan failed")),
            Some(Ok(bytes)) => Oid::from_bytes(&bytes)
                .map(Some)
                .ok_or_else(|| Error::codec(format!("bad OID of {} bytes", bytes.len()))),
        }
    }
}

/// K-way merge of ascending locators into one ascending stream.
///
/// An OID reported by several sources is yielded once.
pub struct SortingLocator {
    sources: Vec<BoxedLocator>,
    heap: BinaryHeap<Reverse<(Oid, usize)>>,
    primed: bool,
    last: Option<Oid>,
}

impl SortingLocator {
    pub fn new(sources: Vec<BoxedLocator>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            primed: false,
            last: None,
        }
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        if let Some(oid) = self.sources[source].next_oid()? {
            self.heap.push(Reverse((oid, source)));
        }
        Ok(())
    }
}

impl TupleLocator for SortingLocator {
    fn next_oid(&mut self) -> Result<Option<Oid>> {
        if !self.primed {
            self.primed = true;
            for i in 0..self.sources.len() {
                self.pull(i)?;
            }
        }

        while let Some(Reverse((oid, source))) = self.heap.pop() {
            self.pull(source)?;
            if self.last == Some(oid) {
                continue;
            }
            self.last = Some(oid);
            return Ok(Some(oid));
        }
        Ok(None)
    }
}

/// Drain a locator into a vector
pub fn collect(locator: &mut dyn TupleLocator) -> Result<Vec<Oid>> {
    let mut out = Vec::new();
    while let Some(oid) = locator.next_oid()? {
        out.push(oid);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Disk, MemoryDisk, TxnMode};
    use rand::Rng;
    use rand::seq::SliceRandom;
    use std::sync::Arc;

    fn oids(ids: &[u64]) -> Vec<Oid> {
        ids.iter().map(|&i| Oid::new(0, i)).collect()
    }

    #[test]
    fn test_vec_locator_sorts_and_dedups() {
        let mut loc = VecLocator::new(oids(&[5, 1, 5, 3]));
        assert_eq!(collect(&mut loc).unwrap(), oids(&[1, 3, 5]));
    }

    #[test]
    fn test_sorting_locator_merges_in_order() {
        let sources: Vec<BoxedLocator> = vec![
            Box::new(VecLocator::new(oids(&[2, 7, 9]))),
            Box::new(VecLocator::new(oids(&[1, 7, 8]))),
            Box::new(VecLocator::new(Vec::new())),
            Box::new(VecLocator::new(oids(&[3]))),
        ];
        let mut merged = SortingLocator::new(sources);
        assert_eq!(collect(&mut merged).unwrap(), oids(&[1, 2, 3, 7, 8, 9]));
    }

    #[test]
    fn test_sorting_locator_random_partitions() {
        let mut rng = rand::thread_rng();
        let mut all: Vec<u64> = (0..200).collect();
        all.shuffle(&mut rng);

        let mut parts = vec![Vec::new(), Vec::new(), Vec::new()];
        for id in &all {
            parts[rng.gen_range(0..3)].push(*id);
        }
        let sources: Vec<BoxedLocator> = parts
            .into_iter()
            .map(|p| Box::new(VecLocator::new(oids(&p))) as BoxedLocator)
            .collect();

        let merged = collect(&mut SortingLocator::new(sources)).unwrap();
        let expected: Vec<Oid> = (0..200).map(|i| Oid::new(0, i)).collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_cursor_locator_decodes_oids() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let mut txn = disk.begin(TxnMode::Write).unwrap();
        for id in [3u64, 1, 2] {
            txn.put("t", &Oid::new(0, id).to_bytes(), b"").unwrap();
        }
        txn.commit().unwrap();

        let mut loc = CursorLocator::new(Cursor::table(disk, "t", 2));
        assert_eq!(collect(&mut loc).unwrap(), oids(&[1, 2, 3]));
    }
}
