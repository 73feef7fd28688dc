//! Lease tracking and reaping
//!
//! A [`LeaseTracker`] remembers when each entry's lease runs out so expired
//! entries can be purged without scanning. Its view is a lower bound: an
//! entry may have been renewed or taken since it was tracked, so the reaper
//! callback re-checks each candidate.

use crate::sleeve::EntrySleeve;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error};
use tuplespace_common::{Oid, Result, TypeName, FOREVER};

/// What the reaper callback did with one expired candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Marked deleted
    Reaped,
    /// Renewed since tracked, carries the new expiry
    Renewed(u64),
    /// A reap filter or an open transaction kept it
    Vetoed,
    /// Already taken or gone from disk
    Gone,
}

pub trait LeaseTracker: Send + Sync {
    fn track(&self, oid: Oid, expiry: u64);

    fn untrack(&self, oid: Oid);

    /// Offer every entry whose lease ran out before `now` to `reaper`.
    /// Returns the number reaped.
    fn bring_out_the_dead(
        &self,
        now: u64,
        reaper: &mut dyn FnMut(Oid) -> Result<ReapOutcome>,
    ) -> usize;

    fn tracked(&self) -> usize;
}

#[derive(Default)]
struct TrackerState {
    by_expiry: BTreeSet<(u64, Oid)>,
    by_oid: HashMap<Oid, u64>,
}

impl TrackerState {
    fn insert(&mut self, oid: Oid, expiry: u64) {
        if let Some(old) = self.by_oid.insert(oid, expiry) {
            self.by_expiry.remove(&(old, oid));
        }
        self.by_expiry.insert((expiry, oid));
    }

    fn remove(&mut self, oid: Oid) {
        if let Some(old) = self.by_oid.remove(&oid) {
            self.by_expiry.remove(&(old, oid));
        }
    }
}

/// Tracker ordered by expiry time
#[derive(Default)]
pub struct ExpiryTracker {
    state: Mutex<TrackerState>,
}

impl ExpiryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest tracked expiry
    pub fn next_expiry(&self) -> Option<u64> {
        self.state.lock().by_expiry.first().map(|(expiry, _)| *expiry)
    }
}

impl LeaseTracker for ExpiryTracker {
    fn track(&self, oid: Oid, expiry: u64) {
        let mut state = self.state.lock();
        if expiry == FOREVER {
            state.remove(oid);
        } else {
            state.insert(oid, expiry);
        }
    }

    fn untrack(&self, oid: Oid) {
        self.state.lock().remove(oid);
    }

    fn bring_out_the_dead(
        &self,
        now: u64,
        reaper: &mut dyn FnMut(Oid) -> Result<ReapOutcome>,
    ) -> usize {
        let expired: Vec<(u64, Oid)> = {
            let mut state = self.state.lock();
            let expired: Vec<_> = state
                .by_expiry
                .iter()
                .take_while(|(expiry, _)| *expiry < now)
                .copied()
                .collect();
            for (_, oid) in &expired {
                state.remove(*oid);
            }
            expired
        };

        let mut reaped = 0;
        for (expiry, oid) in expired {
            match reaper(oid) {
                Ok(ReapOutcome::Reaped) => reaped += 1,
                Ok(ReapOutcome::Renewed(expiry)) => self.track(oid, expiry),
                Ok(ReapOutcome::Vetoed) => self.track(oid, expiry),
                Ok(ReapOutcome::Gone) => {}
                Err(e) => {
                    error!("Reaping {} failed: {}", oid, e);
                    self.track(oid, expiry);
                }
            }
        }
        if reaped > 0 {
            debug!("Reaped {} expired entries", reaped);
        }
        reaped
    }

    fn tracked(&self) -> usize {
        self.state.lock().by_oid.len()
    }
}

/// Tracker for spaces with reaping disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracker;

impl LeaseTracker for NullTracker {
    fn track(&self, _oid: Oid, _expiry: u64) {}

    fn untrack(&self, _oid: Oid) {}

    fn bring_out_the_dead(
        &self,
        _now: u64,
        _reaper: &mut dyn FnMut(Oid) -> Result<ReapOutcome>,
    ) -> usize {
        0
    }

    fn tracked(&self) -> usize {
        0
    }
}

/// Veto hook consulted before an expired entry is purged
pub trait ReapFilter: Send + Sync {
    fn allow_reap(&self, type_name: &TypeName, sleeve: &EntrySleeve) -> bool;
}

/// Registry of reap filters shared by all types
#[derive(Default)]
pub struct Reaper {
    filters: RwLock<Vec<Arc<dyn ReapFilter>>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter(&self, filter: Arc<dyn ReapFilter>) {
        self.filters.write().push(filter);
    }

    /// Whether every filter agrees `sleeve` may be purged
    pub fn permits(&self, type_name: &TypeName, sleeve: &EntrySleeve) -> bool {
        self.filters
            .read()
            .iter()
            .all(|f| f.allow_reap(type_name, sleeve))
    }
}
