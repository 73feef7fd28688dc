//! Adaptive Replacement Cache (ARC) of sleeve blocks
//!
//! ARC combines recency and frequency to make eviction decisions,
//! automatically adapting to workload patterns. It maintains:
//!
//! - T1: Recently accessed blocks (seen once recently)
//! - T2: Frequently accessed blocks (seen multiple times)
//! - B1: Ghost OIDs recently evicted from T1
//! - B2: Ghost OIDs recently evicted from T2
//!
//! A block that is checked out (non-zero reference count), locked, or
//! pinned is skipped by eviction. If nothing is evictable the cache
//! temporarily exceeds its capacity.

use crate::sleeve::EntrySleeve;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::error;
use tuplespace_common::Oid;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub t1_hits: AtomicU64,
    pub t2_hits: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

/// One resident sleeve plus its checkout count
pub struct CacheBlock {
    oid: Oid,
    sleeve: Mutex<EntrySleeve>,
    refs: AtomicU32,
}

impl CacheBlock {
    pub fn new(sleeve: EntrySleeve) -> Self {
        Self {
            oid: sleeve.oid(),
            sleeve: Mutex::new(sleeve),
            refs: AtomicU32::new(0),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Lock the sleeve
    pub fn lock(&self) -> MutexGuard<'_, EntrySleeve> {
        self.sleeve.lock()
    }

    /// Current checkout count
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let released = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            error!("Cache block {} released more often than acquired", self.oid);
            debug_assert!(released, "double release of cache block {}", self.oid);
        }
    }

    fn evictable(&self) -> bool {
        self.refs() == 0 && self.sleeve.try_lock().is_some_and(|s| !s.is_pinned())
    }
}

/// ARC cache internal state
struct ArcState {
    /// Recently accessed (seen once)
    t1: VecDeque<Oid>,
    /// Frequently accessed (seen multiple times)
    t2: VecDeque<Oid>,
    /// Ghost entries from T1
    b1: VecDeque<Oid>,
    /// Ghost entries from T2
    b2: VecDeque<Oid>,
    /// Resident blocks
    cache: HashMap<Oid, Arc<CacheBlock>>,
    /// Target size for T1 (adaptive parameter)
    p: usize,
    /// Maximum cache capacity
    capacity: usize,
    /// Blocks that left the cache so far
    departures: u64,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            cache: HashMap::with_capacity(capacity),
            p: 0,
            capacity,
            departures: 0,
        }
    }

    /// Current size of T1 + T2 (resident blocks)
    fn cache_size(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    /// Current size of B1 + B2 (ghost entries)
    fn ghost_size(&self) -> usize {
        self.b1.len() + self.b2.len()
    }

    /// Oldest evictable position in a resident list
    fn victim(&self, list: &VecDeque<Oid>) -> Option<usize> {
        list.iter()
            .position(|oid| self.cache.get(oid).is_none_or(|b| b.evictable()))
    }

    fn remove_resident(&mut self, oid: &Oid) -> Option<Arc<CacheBlock>> {
        self.t1.retain(|k| k != oid);
        self.t2.retain(|k| k != oid);
        let removed = self.cache.remove(oid);
        if removed.is_some() {
            self.departures += 1;
        }
        removed
    }
}

/// Adaptive Replacement Cache of sleeve blocks
pub struct ArcCache {
    state: Mutex<ArcState>,
    stats: CacheStats,
}

impl ArcCache {
    /// Create a new ARC cache with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
            stats: CacheStats::default(),
        }
    }

    /// Check out a resident block, counting a hit or a miss
    pub fn get(&self, oid: &Oid) -> Option<Arc<CacheBlock>> {
        let mut state = self.state.lock();

        // Check T1
        if state.t1.contains(oid) {
            // Move from T1 to T2 (now frequently accessed)
            state.t1.retain(|k| k != oid);
            state.t2.push_back(*oid);

            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats.t1_hits.fetch_add(1, Ordering::Relaxed);
            return state.cache.get(oid).map(checkout);
        }

        // Check T2
        if state.t2.contains(oid) {
            // Move to back of T2 (most recently used)
            state.t2.retain(|k| k != oid);
            state.t2.push_back(*oid);

            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats.t2_hits.fetch_add(1, Ordering::Relaxed);
            return state.cache.get(oid).map(checkout);
        }

        // Miss
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Check out a resident block without touching recency or statistics
    pub fn peek(&self, oid: &Oid) -> Option<Arc<CacheBlock>> {
        self.state.lock().cache.get(oid).map(checkout)
    }

    /// Number of blocks that have left the cache so far. Taken before a
    /// load and handed to [`put_loaded`](Self::put_loaded).
    pub fn ticket(&self) -> u64 {
        self.state.lock().departures
    }

    /// Make `block` resident and check it out. If a block for the same OID
    /// is already resident (a concurrent load won), that one is returned.
    pub fn put(&self, block: Arc<CacheBlock>) -> Arc<CacheBlock> {
        self.admit(block).0
    }

    /// [`put`](Self::put) for a block built from a load that started at
    /// `ticket`. The flag is set when the block is new and some block left
    /// the cache meanwhile, in which case the loaded state may be stale.
    pub fn put_loaded(&self, block: Arc<CacheBlock>, ticket: u64) -> (Arc<CacheBlock>, bool) {
        let (block, fresh, departures) = self.admit(block);
        (block, fresh && departures != ticket)
    }

    fn admit(&self, block: Arc<CacheBlock>) -> (Arc<CacheBlock>, bool, u64) {
        let mut state = self.state.lock();
        let departures = state.departures;

        // Case 1: already resident
        if let Some(existing) = state.cache.get(&block.oid()) {
            return (checkout(existing), false, departures);
        }
        (self.place(&mut state, block), true, departures)
    }

    fn place(&self, state: &mut ArcState, block: Arc<CacheBlock>) -> Arc<CacheBlock> {
        let oid = block.oid();
        let capacity = state.capacity;

        // Case 2: Key is in B1 (ghost - was recently evicted from T1)
        if state.b1.contains(&oid) {
            // Adapt: increase target size for T1
            let delta = std::cmp::max(1, state.b2.len() / state.b1.len().max(1));
            state.p = std::cmp::min(capacity, state.p + delta);
            state.b1.retain(|k| k != &oid);

            self.replace(state, false);
            state.t2.push_back(oid);
            return insert(state, block);
        }

        // Case 3: Key is in B2 (ghost - was recently evicted from T2)
        if state.b2.contains(&oid) {
            // Adapt: decrease target size for T1
            let delta = std::cmp::max(1, state.b1.len() / state.b2.len().max(1));
            state.p = state.p.saturating_sub(delta);
            state.b2.retain(|k| k != &oid);

            self.replace(state, true);
            state.t2.push_back(oid);
            return insert(state, block);
        }

        // Case 4: new OID
        let l1_size = state.t1.len() + state.b1.len();

        if l1_size >= capacity {
            // L1 (T1 + B1) is full
            if state.t1.len() < capacity {
                state.b1.pop_front();
                self.replace(state, false);
            } else if let Some(pos) = state.victim(&state.t1) {
                if let Some(evicted) = state.t1.remove(pos) {
                    state.cache.remove(&evicted);
                    state.b1.push_back(evicted);
                    state.departures += 1;
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if state.cache_size() + state.ghost_size() >= capacity {
            // Cache is full but L1 has room
            if state.cache_size() + state.ghost_size() >= 2 * capacity {
                // Ghost entries at max - remove from B2
                state.b2.pop_front();
            }
            self.replace(state, false);
        }

        state.t1.push_back(oid);
        insert(state, block)
    }

    /// Replace algorithm - evict from T1 or T2, skipping blocks in use
    fn replace(&self, state: &mut ArcState, in_b2: bool) {
        if state.cache_size() < state.capacity {
            return;
        }

        let t1_len = state.t1.len();
        let prefer_t1 = t1_len > 0 && if in_b2 { t1_len >= state.p } else { t1_len > state.p };

        let from_t1 = |state: &mut ArcState| -> bool {
            let Some(pos) = state.victim(&state.t1) else {
                return false;
            };
            if let Some(evicted) = state.t1.remove(pos) {
                state.cache.remove(&evicted);
                state.b1.push_back(evicted);
                state.departures += 1;
            }
            true
        };
        let from_t2 = |state: &mut ArcState| -> bool {
            let Some(pos) = state.victim(&state.t2) else {
                return false;
            };
            if let Some(evicted) = state.t2.remove(pos) {
                state.cache.remove(&evicted);
                state.b2.push_back(evicted);
                state.departures += 1;
            }
            true
        };

        let evicted = if prefer_t1 {
            from_t1(state) || from_t2(state)
        } else {
            from_t2(state) || from_t1(state)
        };
        if evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop a resident block, keeping no ghost for it
    pub fn remove(&self, oid: &Oid) -> Option<Arc<CacheBlock>> {
        self.state.lock().remove_resident(oid)
    }

    /// Drop a resident block only if nobody has it checked out
    pub fn remove_if_idle(&self, oid: &Oid) -> bool {
        let mut state = self.state.lock();
        if state.cache.get(oid).is_some_and(|b| b.refs() == 0) {
            state.remove_resident(oid);
            true
        } else {
            false
        }
    }

    /// Check if an OID is resident
    pub fn contains(&self, oid: &Oid) -> bool {
        self.state.lock().cache.contains_key(oid)
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get current number of resident blocks
    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache capacity
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Get diagnostic info about internal state
    pub fn debug_info(&self) -> ArcDebugInfo {
        let state = self.state.lock();
        ArcDebugInfo {
            t1_len: state.t1.len(),
            t2_len: state.t2.len(),
            b1_len: state.b1.len(),
            b2_len: state.b2.len(),
            p: state.p,
            capacity: state.capacity,
        }
    }
}

fn checkout(block: &Arc<CacheBlock>) -> Arc<CacheBlock> {
    block.acquire();
    Arc::clone(block)
}

fn insert(state: &mut ArcState, block: Arc<CacheBlock>) -> Arc<CacheBlock> {
    let out = checkout(&block);
    state.cache.insert(block.oid(), block);
    out
}

/// Debug information about ARC state
#[derive(Debug)]
pub struct ArcDebugInfo {
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub p: usize,
    pub capacity: usize,
}
