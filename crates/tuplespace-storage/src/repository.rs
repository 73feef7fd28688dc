//! Entry repository
//!
//! The per-type facade used by the space. Before the first mutating
//! operation of its lifetime a repository logs its current instance count,
//! giving replay a baseline to check the recovered count against. The
//! barrier is passed once; if logging fails the next mutation tries again.

use crate::cache::RecoverySummary;
use crate::codec::{MangledEntry, PersistentEntry};
use crate::counters::CounterSnapshot;
use crate::oplog::LogRecord;
use crate::ops::{SearchResponse, SearchVisitor, WriteEscort};
use crate::sleeve_cache::SleeveCache;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use tuplespace_common::{expiry_after, now_millis, Oid, Result, TypeName};

pub struct EntryRepository {
    cache: Arc<SleeveCache>,
    counted: Mutex<bool>,
}

impl EntryRepository {
    pub fn new(cache: Arc<SleeveCache>) -> Self {
        Self {
            cache,
            counted: Mutex::new(false),
        }
    }

    pub fn type_name(&self) -> &TypeName {
        self.cache.type_name()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        self.cache.storage()
    }

    pub fn sleeve_cache(&self) -> &Arc<SleeveCache> {
        &self.cache
    }

    fn instance_count_barrier(&self) -> Result<()> {
        let mut counted = self.counted.lock();
        if *counted {
            return Ok(());
        }
        let count = self.cache.instances();
        if let Some(log) = self.cache.oplog() {
            log.append(&LogRecord::InstanceCount {
                type_name: self.type_name().clone(),
                count,
            })?;
        }
        debug!("{}: logged instance count {}", self.type_name(), count);
        *counted = true;
        Ok(())
    }

    /// Write `entry` with a lease of `lease_ms` milliseconds
    pub fn write(
        &self,
        entry: MangledEntry,
        lease_ms: u64,
        escort: &dyn WriteEscort,
    ) -> Result<Option<Oid>> {
        self.instance_count_barrier()?;
        self.cache
            .write(entry, expiry_after(now_millis(), lease_ms), escort)
    }

    pub fn find(
        &self,
        template: &MangledEntry,
        visitor: &mut dyn SearchVisitor,
    ) -> Result<SearchResponse> {
        if visitor.is_deleter() {
            self.instance_count_barrier()?;
        }
        self.cache.find(template, visitor)
    }

    pub fn find_by_oid(&self, oid: Oid, visitor: &mut dyn SearchVisitor) -> Result<SearchResponse> {
        if visitor.is_deleter() {
            self.instance_count_barrier()?;
        }
        self.cache.find_by_oid(oid, visitor)
    }

    /// Live entry for `oid`
    pub fn load(&self, oid: Oid) -> Result<Option<PersistentEntry>> {
        self.cache.get(oid)
    }

    /// Extend the lease of `oid` by `lease_ms` from now; 0 cancels
    pub fn renew(&self, oid: Oid, lease_ms: u64) -> Result<bool> {
        let expiry = if lease_ms == 0 {
            0
        } else {
            expiry_after(now_millis(), lease_ms)
        };
        self.renew_until(oid, expiry)
    }

    /// Set the absolute expiry of `oid`; 0 cancels
    pub fn renew_until(&self, oid: Oid, expiry: u64) -> Result<bool> {
        self.instance_count_barrier()?;
        self.cache.renew(oid, expiry)
    }

    pub fn cancel(&self, oid: Oid) -> Result<bool> {
        self.renew_until(oid, 0)
    }

    /// Commit a pinned write
    pub fn flush(&self, oid: Oid) -> Result<bool> {
        self.instance_count_barrier()?;
        self.cache.flush(oid)
    }

    /// Discard a pinned write
    pub fn abort_write(&self, oid: Oid) -> Result<bool> {
        self.cache.abort_write(oid)
    }

    /// Delete `oid` unconditionally
    pub fn remove(&self, oid: Oid) -> Result<bool> {
        self.instance_count_barrier()?;
        self.cache.remove(oid)
    }

    pub fn delete_all(&self) -> Result<usize> {
        self.instance_count_barrier()?;
        self.cache.delete_all()
    }

    /// Replay a logged take
    pub(crate) fn replay_take(&self, oid: Oid) -> Result<bool> {
        self.cache.replay_take(oid)
    }

    /// Replay a logged lease change
    pub(crate) fn replay_renew(&self, oid: Oid, expiry: u64) -> Result<bool> {
        self.cache.replay_renew(oid, expiry)
    }

    /// Replay a logged write
    pub fn recover(&self, entry: PersistentEntry) -> Result<RecoverySummary> {
        self.cache.recover(entry)
    }

    pub fn reap(&self, now: u64) -> usize {
        self.cache.reap(now)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.cache.counters()
    }

    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cache.shutdown()
    }
}
