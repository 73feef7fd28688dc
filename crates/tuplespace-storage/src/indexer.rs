//! In-memory index of written sleeves not yet on disk
//!
//! The disk indexes only learn about an entry once the write scheduler
//! flushes it. Until then searches find it through here.

use crate::codec::MangledEntry;
use crate::locator::{BoxedLocator, VecLocator};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tuplespace_common::Oid;

#[derive(Default)]
struct IndexerState {
    /// Per field offset: hash -> OIDs
    by_field: Vec<HashMap<u32, BTreeSet<Oid>>>,
    /// OID -> hash per field, `None` for null fields
    hashes: HashMap<Oid, Vec<Option<u32>>>,
}

#[derive(Default)]
pub struct CacheIndexer {
    state: Mutex<IndexerState>,
}

impl CacheIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(&self, oid: Oid, entry: &MangledEntry) {
        let hashes: Vec<Option<u32>> = (0..entry.field_count()).map(|i| entry.field_hash(i)).collect();

        let mut state = self.state.lock();
        if state.by_field.len() < hashes.len() {
            state.by_field.resize_with(hashes.len(), HashMap::new);
        }
        for (i, hash) in hashes.iter().enumerate() {
            if let Some(hash) = hash {
                state.by_field[i].entry(*hash).or_default().insert(oid);
            }
        }
        state.hashes.insert(oid, hashes);
    }

    pub fn removed(&self, oid: Oid) {
        let mut state = self.state.lock();
        let Some(hashes) = state.hashes.remove(&oid) else {
            return;
        };
        for (i, hash) in hashes.into_iter().enumerate() {
            let Some(hash) = hash else { continue };
            let field = &mut state.by_field[i];
            if let Some(set) = field.get_mut(&hash) {
                set.remove(&oid);
                if set.is_empty() {
                    field.remove(&hash);
                }
            }
        }
    }

    /// Candidates for `template`, driven by its most selective field.
    /// `None` when nothing indexed here can match.
    pub fn locator(&self, template: &MangledEntry) -> Option<BoxedLocator> {
        let state = self.state.lock();
        if state.hashes.is_empty() {
            return None;
        }
        if template.is_wildcard() {
            return Some(Box::new(VecLocator::new(state.hashes.keys().copied().collect())));
        }

        let mut best: Option<&BTreeSet<Oid>> = None;
        for i in 0..template.field_count() {
            let Some(hash) = template.field_hash(i) else {
                continue;
            };
            let set = state.by_field.get(i).and_then(|f| f.get(&hash))?;
            if best.is_none_or(|b| set.len() < b.len()) {
                best = Some(set);
            }
        }

        let oids: Vec<Oid> = match best {
            Some(set) => set.iter().copied().collect(),
            None => state.hashes.keys().copied().collect(),
        };
        Some(Box::new(VecLocator::new(oids)))
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.state.lock().hashes.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.state.lock().hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
