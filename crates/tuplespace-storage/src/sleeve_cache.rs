//! Per-type sleeve cache
//!
//! Ties together the partitioned cache, the write scheduler, the in-memory
//! indexer and the on-disk storage of one entry type. Reads see the newest
//! state of an entry regardless of where it currently lives:
//!
//! 1. resident in the cache
//! 2. pending in the write scheduler's dirty buffer
//! 3. on disk
//!
//! Searches consult the indexer, then the dirty buffer, then the disk
//! indexes, offering each OID at most once. FIFO types merge all three
//! sources in OID order instead.

use crate::allocator::OidAllocator;
use crate::cache::{CacheBlock, CacheBlockDescriptor, CacheListener, PartitionedCache, RecoverySummary};
use crate::codec::{MangledEntry, PersistentEntry};
use crate::counters::{CounterSnapshot, Counters};
use crate::dirty::{DirtyBuffer, DirtyView, FlushKind, PushOutcome};
use crate::disk::Disk;
use crate::indexer::CacheIndexer;
use crate::lease::{LeaseTracker, ReapOutcome, Reaper};
use crate::locator::{BoxedLocator, SortingLocator, TupleLocator};
use crate::oplog::{LogRecord, OpLog};
use crate::ops::{SearchOffer, SearchResponse, SearchVisitor, WriteEscort, WriteOp};
use crate::sleeve::EntrySleeve;
use crate::storage::Storage;
use crate::writer::{EntryEditor, FlushObserver, WriteScheduler};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use tuplespace_common::{now_millis, Config, Oid, Result, TypeName};

/// Routes cache events to the write scheduler and the indexer
struct DirtyRouter {
    scheduler: Arc<WriteScheduler>,
    indexer: Arc<CacheIndexer>,
}

impl CacheListener for DirtyRouter {
    fn dirtied(&self, block: &CacheBlock) {
        let (kind, entry) = {
            let sleeve = block.lock();
            if sleeve.is_pinned() {
                return;
            }
            let kind = if sleeve.is_deleted() {
                FlushKind::Delete
            } else if sleeve.is_on_disk() {
                FlushKind::Update
            } else {
                FlushKind::Write
            };
            (kind, sleeve.entry().duplicate())
        };

        let oid = entry.oid();
        if self.scheduler.add(kind, entry) == PushOutcome::Cancelled {
            debug!("Write of {} cancelled before reaching disk", oid);
        }
        if kind == FlushKind::Delete {
            self.indexer.removed(oid);
        }
    }

    fn flushed(&self, oid: Oid, _kind: FlushKind) {
        self.indexer.removed(oid);
    }

    fn force(&self, oid: Oid) -> Result<()> {
        self.scheduler.force(oid)
    }

    fn sync(&self) -> Result<()> {
        self.scheduler.sync()
    }
}

/// Per-type behaviour chosen at open
pub struct SleeveCacheOptions {
    pub tracker: Arc<dyn LeaseTracker>,
    pub reaper: Arc<Reaper>,
    pub oplog: Option<Arc<OpLog>>,
    pub must_exist: bool,
}

pub struct SleeveCache {
    type_name: TypeName,
    storage: Arc<Storage>,
    cache: PartitionedCache,
    scheduler: Arc<WriteScheduler>,
    indexer: Arc<CacheIndexer>,
    tracker: Arc<dyn LeaseTracker>,
    reaper: Arc<Reaper>,
    counters: Counters,
    allocator: OidAllocator,
    oplog: Option<Arc<OpLog>>,
    fifo: bool,
    early_flush: bool,
}

impl SleeveCache {
    /// Open the cache for `type_name`, loading instance counts and leases
    /// from what is already on disk
    pub fn open(
        type_name: TypeName,
        disk: Arc<dyn Disk>,
        config: &Config,
        options: SleeveCacheOptions,
    ) -> Result<Arc<Self>> {
        let dirty = Arc::new(DirtyBuffer::new());
        let storage = Arc::new(Storage::new(
            type_name.clone(),
            disk,
            &config.storage,
            Arc::clone(&dirty),
        ));
        storage.init(options.must_exist)?;

        let editor: Arc<dyn EntryEditor> = Arc::clone(&storage) as Arc<dyn EntryEditor>;
        let scheduler = Arc::new(WriteScheduler::start(
            type_name.to_string(),
            dirty,
            editor,
            config.writer.clone(),
        )?);
        let indexer = Arc::new(CacheIndexer::new());
        let router = Arc::new(DirtyRouter {
            scheduler: Arc::clone(&scheduler),
            indexer: Arc::clone(&indexer),
        });

        let fifo = config.entry.is_fifo(type_name.as_str());
        let zones = if fifo { 1 } else { config.entry.oid_zones };
        let allocator = OidAllocator::new(Arc::clone(&storage), zones)?;

        let cache = Arc::new(Self {
            type_name,
            storage,
            cache: PartitionedCache::new(&config.cache, router),
            scheduler,
            indexer,
            tracker: options.tracker,
            reaper: options.reaper,
            counters: Counters::new(),
            allocator,
            oplog: options.oplog,
            fifo,
            early_flush: config.entry.early_flush_on_take,
        });

        let observer: Weak<dyn FlushObserver> = Arc::downgrade(&cache) as Weak<dyn FlushObserver>;
        cache.scheduler.set_observer(observer);
        cache.bootstrap()?;
        Ok(cache)
    }

    fn bootstrap(&self) -> Result<()> {
        self.storage.for_each_entry(|entry| {
            self.counters.on_loaded();
            self.tracker.track(entry.oid(), entry.expiry());
            Ok(())
        })?;
        info!(
            "Opened {} ({} entries, {} leases tracked, fifo: {})",
            self.type_name,
            self.counters.instances(),
            self.tracker.tracked(),
            self.fifo
        );
        Ok(())
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo
    }

    pub fn instances(&self) -> i64 {
        self.counters.instances()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot(
            self.scheduler.pending(),
            self.scheduler.dropped(),
            self.cache.stats(),
        )
    }

    /// Write a new entry. Returns `None` if the escort refused it.
    pub fn write(
        &self,
        entry: MangledEntry,
        expiry: u64,
        escort: &dyn WriteEscort,
    ) -> Result<Option<Oid>> {
        self.storage.set_fields(&entry.field_names())?;

        let oid = self.allocator.next()?;
        let persistent = PersistentEntry::new(oid, entry, expiry);
        let op = WriteOp::new(self.type_name.clone(), persistent.duplicate());
        if !escort.writing(&op)? {
            debug!("Write of {} refused by escort", oid);
            return Ok(None);
        }

        let mut sleeve = EntrySleeve::written(persistent);
        let pinned = escort.pins();
        if pinned {
            sleeve.pin();
        }
        self.indexer.added(oid, sleeve.entry().entry()?);

        let mut cbd = self.cache.insert(sleeve);
        if !pinned {
            cbd.mark_dirty();
        }
        cbd.release();

        self.tracker.track(oid, expiry);
        self.counters.on_write();
        Ok(Some(oid))
    }

    fn load_sleeve(&self, oid: Oid) -> Result<Option<EntrySleeve>> {
        match self.scheduler.dirty_read(oid) {
            Some(DirtyView::Live(entry)) => Ok(Some(EntrySleeve::written(entry))),
            Some(DirtyView::Deleted) => Ok(None),
            None => Ok(self.storage.load(oid)?.map(EntrySleeve::loaded)),
        }
    }

    /// Check out the sleeve of `oid` from wherever it lives
    pub fn load(&self, oid: Oid) -> Result<Option<CacheBlockDescriptor<'_>>> {
        self.cache.find(oid, |oid| self.load_sleeve(oid))
    }

    /// Copy of the live entry for `oid`
    pub fn get(&self, oid: Oid) -> Result<Option<PersistentEntry>> {
        let Some(cbd) = self.load(oid)? else {
            return Ok(None);
        };
        let sleeve = cbd.sleeve();
        Ok(sleeve
            .is_live(now_millis())
            .then(|| sleeve.entry().duplicate()))
    }

    /// Offer entries matching `template` to `visitor` until it accepts or
    /// stops
    pub fn find(
        &self,
        template: &MangledEntry,
        visitor: &mut dyn SearchVisitor,
    ) -> Result<SearchResponse> {
        let now = now_millis();
        let mut seen = HashSet::new();

        if self.fifo {
            let mut sources: Vec<BoxedLocator> = Vec::new();
            sources.extend(self.indexer.locator(template));
            sources.extend(self.storage.find_cached(template));
            sources.extend(self.storage.find(template)?);
            let mut merged = SortingLocator::new(sources);
            return Ok(self
                .offer_from(&mut merged, template, visitor, &mut seen, now)?
                .unwrap_or(SearchResponse::TryAgain));
        }

        if let Some(mut locator) = self.indexer.locator(template) {
            if let Some(r) = self.offer_from(locator.as_mut(), template, visitor, &mut seen, now)? {
                return Ok(r);
            }
        }
        if let Some(mut locator) = self.storage.find_cached(template) {
            if let Some(r) = self.offer_from(locator.as_mut(), template, visitor, &mut seen, now)? {
                return Ok(r);
            }
        }
        if let Some(mut locator) = self.storage.find(template)? {
            if let Some(r) = self.offer_from(locator.as_mut(), template, visitor, &mut seen, now)? {
                return Ok(r);
            }
        }
        Ok(SearchResponse::TryAgain)
    }

    /// Offer the single entry `oid` to `visitor`
    pub fn find_by_oid(&self, oid: Oid, visitor: &mut dyn SearchVisitor) -> Result<SearchResponse> {
        self.offer(oid, None, visitor, now_millis())
    }

    fn offer_from(
        &self,
        locator: &mut dyn TupleLocator,
        template: &MangledEntry,
        visitor: &mut dyn SearchVisitor,
        seen: &mut HashSet<Oid>,
        now: u64,
    ) -> Result<Option<SearchResponse>> {
        while let Some(oid) = locator.next_oid()? {
            if !seen.insert(oid) {
                continue;
            }
            let response = self.offer(oid, Some(template), visitor, now)?;
            if response.is_terminal() {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    fn offer(
        &self,
        oid: Oid,
        template: Option<&MangledEntry>,
        visitor: &mut dyn SearchVisitor,
        now: u64,
    ) -> Result<SearchResponse> {
        let Some(mut cbd) = self.load(oid)? else {
            return Ok(SearchResponse::TryAgain);
        };

        let mut purged = false;
        let mut taken: Option<bool> = None;
        let response = {
            let mut sleeve = cbd.sleeve();
            if sleeve.is_deleted() || sleeve.is_pinned() {
                SearchResponse::TryAgain
            } else if sleeve.has_expired(now) {
                if self.reaper.permits(&self.type_name, &sleeve) {
                    sleeve.set_deleted();
                    purged = true;
                }
                SearchResponse::TryAgain
            } else if let Some(t) = template
                && !sleeve.entry().entry()?.matches(t)
            {
                SearchResponse::TryAgain
            } else {
                let response = visitor.offer(&SearchOffer::new(&self.type_name, sleeve.entry()));
                if response == SearchResponse::Accepted && visitor.is_deleter() {
                    taken = Some(sleeve.is_on_disk());
                    sleeve.set_deleted();
                }
                response
            }
        };

        let appended = if taken.is_some() {
            self.log_take(oid)
        } else {
            Ok(())
        };
        if purged || taken.is_some() {
            cbd.mark_dirty();
        }

        if purged {
            drop(cbd);
            self.tracker.untrack(oid);
            self.counters.on_purge();
            debug!("Purged expired {} {}", self.type_name, oid);
        } else if let Some(was_on_disk) = taken {
            // Release first so the delete is queued
            drop(cbd);
            self.tracker.untrack(oid);
            self.counters.on_take();
            appended?;
            if self.early_flush && was_on_disk {
                self.scheduler.force(oid)?;
            }
        } else {
            drop(cbd);
            if response == SearchResponse::Accepted {
                self.counters.on_read();
            }
        }
        Ok(response)
    }

    /// Move the lease of a live entry to `expiry`; 0 cancels it. Returns
    /// false for entries that are gone, expired or not yet committed.
    pub fn renew(&self, oid: Oid, expiry: u64) -> Result<bool> {
        self.set_lease(oid, expiry, true)
    }

    /// [`renew`](Self::renew) for log replay, which must not log again
    pub(crate) fn replay_renew(&self, oid: Oid, expiry: u64) -> Result<bool> {
        self.set_lease(oid, expiry, false)
    }

    fn set_lease(&self, oid: Oid, expiry: u64, logged: bool) -> Result<bool> {
        let Some(mut cbd) = self.load(oid)? else {
            return Ok(false);
        };
        let cancelled = {
            let mut sleeve = cbd.sleeve();
            if !sleeve.is_live(now_millis()) || sleeve.is_pinned() {
                return Ok(false);
            }
            if expiry == 0 {
                sleeve.set_deleted();
                true
            } else {
                sleeve.entry_mut().set_expiry(expiry);
                false
            }
        };
        // Logged before release, so the change cannot reach disk unlogged
        let appended = if logged {
            self.log(LogRecord::Renew {
                type_name: self.type_name.clone(),
                oid,
                expiry,
            })
        } else {
            Ok(())
        };
        cbd.mark_dirty();
        cbd.release();

        if cancelled {
            self.tracker.untrack(oid);
            self.counters.on_purge();
        } else {
            self.tracker.track(oid, expiry);
        }
        appended.map(|()| true)
    }

    pub fn cancel(&self, oid: Oid) -> Result<bool> {
        self.renew(oid, 0)
    }

    /// Delete `oid` if it is not already deleted, logging the take. Ignores
    /// leases.
    pub fn remove(&self, oid: Oid) -> Result<bool> {
        self.delete(oid, true)
    }

    /// [`remove`](Self::remove) for log replay, which must not log again
    pub(crate) fn replay_take(&self, oid: Oid) -> Result<bool> {
        self.delete(oid, false)
    }

    fn delete(&self, oid: Oid, logged: bool) -> Result<bool> {
        let Some(mut cbd) = self.load(oid)? else {
            return Ok(false);
        };
        {
            let mut sleeve = cbd.sleeve();
            if sleeve.is_deleted() {
                return Ok(false);
            }
            sleeve.set_deleted();
        }
        let appended = if logged { self.log_take(oid) } else { Ok(()) };
        cbd.mark_dirty();
        cbd.release();

        self.tracker.untrack(oid);
        self.counters.on_take();
        appended.map(|()| true)
    }

    /// Delete every entry of this type, forcing each delete to disk
    pub fn delete_all(&self) -> Result<usize> {
        let template = MangledEntry::new(self.type_name.clone());
        let mut sources: Vec<BoxedLocator> = Vec::new();
        sources.extend(self.indexer.locator(&template));
        sources.extend(self.storage.find_cached(&template));
        sources.push(Box::new(self.storage.scan_all()));
        let mut all = SortingLocator::new(sources);

        let mut deleted = 0;
        while let Some(oid) = all.next_oid()? {
            let Some(mut cbd) = self.load(oid)? else {
                continue;
            };
            {
                let mut sleeve = cbd.sleeve();
                if sleeve.is_deleted() || sleeve.is_pinned() {
                    continue;
                }
                sleeve.set_deleted();
            }
            let appended = self.log_take(oid);
            cbd.mark_dirty();
            cbd.release();
            self.tracker.untrack(oid);
            deleted += 1;
            if let Err(e) = appended.and_then(|()| self.scheduler.force(oid)) {
                self.counters.on_removed(deleted);
                return Err(e);
            }
        }

        self.counters.on_removed(deleted);
        info!("Deleted all {} entries of {}", deleted, self.type_name);
        Ok(deleted)
    }

    /// Purge entries whose lease ran out before `now`
    pub fn reap(&self, now: u64) -> usize {
        self.tracker
            .bring_out_the_dead(now, &mut |oid| self.reap_one(oid, now))
    }

    fn reap_one(&self, oid: Oid, now: u64) -> Result<ReapOutcome> {
        let Some(mut cbd) = self.load(oid)? else {
            return Ok(ReapOutcome::Gone);
        };
        let outcome = {
            let mut sleeve = cbd.sleeve();
            if sleeve.is_deleted() {
                ReapOutcome::Gone
            } else if !sleeve.has_expired(now) {
                ReapOutcome::Renewed(sleeve.entry().expiry())
            } else if sleeve.is_pinned() || !self.reaper.permits(&self.type_name, &sleeve) {
                ReapOutcome::Vetoed
            } else {
                sleeve.set_deleted();
                ReapOutcome::Reaped
            }
        };
        if outcome == ReapOutcome::Reaped {
            cbd.mark_dirty();
            cbd.release();
            self.counters.on_purge();
        }
        Ok(outcome)
    }

    /// Commit a pinned write: unpin it and schedule it for disk
    pub fn flush(&self, oid: Oid) -> Result<bool> {
        let Some(mut cbd) = self.load(oid)? else {
            return Ok(false);
        };
        {
            let mut sleeve = cbd.sleeve();
            if !sleeve.is_pinned() {
                return Ok(false);
            }
            sleeve.unpin();
        }
        cbd.mark_dirty();
        cbd.release();
        Ok(true)
    }

    /// Discard a pinned write that never reached disk
    pub fn abort_write(&self, oid: Oid) -> Result<bool> {
        let Some(cbd) = self.load(oid)? else {
            return Ok(false);
        };
        {
            let mut sleeve = cbd.sleeve();
            if !sleeve.is_pinned() {
                return Ok(false);
            }
            sleeve.set_deleted();
            sleeve.unpin();
        }
        cbd.release();
        self.cache.evict(oid);

        self.indexer.removed(oid);
        self.tracker.untrack(oid);
        self.counters.on_removed(1);
        Ok(true)
    }

    /// Bring back a logged write during replay
    pub fn recover(&self, entry: PersistentEntry) -> Result<RecoverySummary> {
        self.storage.set_fields(&entry.entry()?.field_names())?;
        let oid = entry.oid();
        let expiry = entry.expiry();

        let (mut cbd, summary) = self
            .cache
            .recover(EntrySleeve::written(entry), |oid| self.load_sleeve(oid))?;
        if !summary.on_disk && !summary.cached {
            {
                let sleeve = cbd.sleeve();
                self.indexer.added(oid, sleeve.entry().entry()?);
            }
            cbd.mark_dirty();
            cbd.release();
            self.tracker.track(oid, expiry);
            self.counters.on_write();
            debug!("Recovered {} {}", self.type_name, oid);
        }
        Ok(summary)
    }

    /// Flush all pending work
    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown()
    }

    fn log(&self, record: LogRecord) -> Result<()> {
        if let Some(log) = &self.oplog {
            log.append(&record)?;
        }
        Ok(())
    }

    fn log_take(&self, oid: Oid) -> Result<()> {
        self.log(LogRecord::Take {
            type_name: self.type_name.clone(),
            oid,
        })
    }

    pub(crate) fn oplog(&self) -> Option<&Arc<OpLog>> {
        self.oplog.as_ref()
    }
}

impl FlushObserver for SleeveCache {
    fn flushed(&self, oid: Oid, kind: FlushKind) {
        self.cache.flushed(oid, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;
    use crate::lease::{ExpiryTracker, NullTracker, ReapFilter};
    use crate::ops::{AutoCommit, Collector, Transactional};
    use tuplespace_common::config::Backend;
    use tuplespace_common::FOREVER;

    fn config() -> Config {
        let mut config = Config::default();
        config.storage.backend = Backend::Memory;
        config.cache.cache_size = 64;
        config.cache.entries_per_partition = 16;
        config
    }

    fn open_on(disk: Arc<dyn Disk>, config: &Config, type_name: &str) -> Arc<SleeveCache> {
        SleeveCache::open(
            TypeName::from(type_name),
            disk,
            config,
            SleeveCacheOptions {
                tracker: Arc::new(ExpiryTracker::new()),
                reaper: Arc::new(Reaper::new()),
                oplog: None,
                must_exist: false,
            },
        )
        .unwrap()
    }

    fn open() -> Arc<SleeveCache> {
        open_on(Arc::new(MemoryDisk::new()), &config(), "Foo")
    }

    fn foo(a: i64, b: &str) -> MangledEntry {
        MangledEntry::new("Foo").with("a", a).with("b", b)
    }

    fn by_a(a: i64) -> MangledEntry {
        MangledEntry::new("Foo").with("a", a).with_null("b")
    }

    fn write(cache: &SleeveCache, entry: MangledEntry) -> Oid {
        cache
            .write(entry, FOREVER, &AutoCommit::default())
            .unwrap()
            .unwrap()
    }

    fn take(cache: &SleeveCache, template: &MangledEntry) -> Option<Oid> {
        let mut visitor = Collector::take_one();
        cache.find(template, &mut visitor).unwrap();
        visitor.first().map(|(oid, _)| *oid)
    }

    fn read_all(cache: &SleeveCache, template: &MangledEntry) -> Vec<Oid> {
        let mut visitor = Collector::read_all();
        cache.find(template, &mut visitor).unwrap();
        visitor.into_found().into_iter().map(|(oid, _)| oid).collect()
    }

    #[test]
    fn test_write_is_visible_before_flush() {
        let cache = open();
        let oid = write(&cache, foo(1, "x"));
        assert_eq!(read_all(&cache, &by_a(1)), vec![oid]);
        assert!(read_all(&cache, &by_a(2)).is_empty());
    }

    #[test]
    fn test_write_then_take_then_miss() {
        let cache = open();
        let oid = write(&cache, foo(1, "x"));
        cache.sync().unwrap();
        assert!(cache.storage().load(oid).unwrap().is_some());

        assert_eq!(take(&cache, &by_a(1)), Some(oid));
        assert_eq!(take(&cache, &by_a(1)), None);
        cache.sync().unwrap();
        assert!(cache.storage().load(oid).unwrap().is_none());

        let counters = cache.counters();
        assert_eq!(counters.instances, 0);
        assert_eq!((counters.writes, counters.takes), (1, 1));
    }

    #[test]
    fn test_take_before_flush_never_touches_disk() {
        let cache = open();
        let oid = write(&cache, foo(1, "x"));
        assert_eq!(take(&cache, &by_a(1)), Some(oid));
        cache.sync().unwrap();
        assert_eq!(cache.storage().num_entries().unwrap(), 0);
    }

    #[test]
    fn test_search_survives_eviction() {
        let cache = open();
        let oids: Vec<Oid> = (0..200).map(|i| write(&cache, foo(i % 5, "x"))).collect();
        cache.sync().unwrap();

        let found = read_all(&cache, &by_a(3));
        assert_eq!(found.len(), 40);
        assert!(found.iter().all(|oid| oids.contains(oid)));
        assert!(cache.counters().cache.resident <= 200);
    }

    #[test]
    fn test_each_oid_offered_once() {
        let cache = open();
        write(&cache, foo(1, "x"));
        write(&cache, foo(1, "y"));
        cache.sync().unwrap();
        write(&cache, foo(1, "z"));

        let found = read_all(&cache, &by_a(1));
        let unique: HashSet<_> = found.iter().collect();
        assert_eq!(found.len(), 3);
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_renew_and_cancel() {
        let cache = open();
        let oid = write(&cache, foo(1, "x"));
        let later = now_millis() + 60_000;
        assert!(cache.renew(oid, later).unwrap());
        assert_eq!(cache.get(oid).unwrap().unwrap().expiry(), later);

        assert!(cache.cancel(oid).unwrap());
        assert!(!cache.renew(oid, later).unwrap());
        assert!(!cache.cancel(oid).unwrap());
        assert!(read_all(&cache, &by_a(1)).is_empty());
        assert!(!cache.renew(Oid::new(0, 999_999), later).unwrap());
    }

    #[test]
    fn test_expired_entries_are_purged_on_search() {
        let cache = open();
        let oid = cache
            .write(foo(1, "x"), 1, &AutoCommit::default())
            .unwrap()
            .unwrap();
        assert!(read_all(&cache, &by_a(1)).is_empty());
        assert!(!cache.renew(oid, FOREVER).unwrap());
        assert_eq!(cache.counters().purges, 1);
    }

    #[test]
    fn test_reaper_purges_expired_entry() {
        let cache = open();
        let expiry = now_millis() + 200;
        let oid = cache
            .write(foo(1, "x"), expiry, &AutoCommit::default())
            .unwrap()
            .unwrap();
        write(&cache, foo(1, "y"));
        assert_eq!(read_all(&cache, &by_a(1)).len(), 2);

        while now_millis() <= expiry {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(cache.counters().purges, 0);
        assert_eq!(cache.reap(now_millis()), 1);

        let found = read_all(&cache, &by_a(1));
        assert_eq!(found.len(), 1);
        assert!(!found.contains(&oid));
        assert_eq!(cache.counters().purges, 1);
        assert_eq!(cache.instances(), 1);
    }

    #[test]
    fn test_renew_refuses_expired_entry() {
        let cache = open();
        let expiry = now_millis() + 20;
        let oid = cache
            .write(foo(1, "x"), expiry, &AutoCommit::default())
            .unwrap()
            .unwrap();
        while now_millis() <= expiry {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(!cache.renew(oid, now_millis() + 60_000).unwrap());

        // Refused without purging or touching the lease
        let cbd = cache.load(oid).unwrap().unwrap();
        {
            let sleeve = cbd.sleeve();
            assert!(!sleeve.is_deleted());
            assert_eq!(sleeve.entry().expiry(), expiry);
        }
        cbd.release();
        assert_eq!(cache.counters().purges, 0);
    }

    #[test]
    fn test_reap_respects_filters() {
        struct Never;
        impl ReapFilter for Never {
            fn allow_reap(&self, _: &TypeName, _: &EntrySleeve) -> bool {
                false
            }
        }

        let cache = open();
        let now = now_millis();
        cache.write(foo(1, "x"), now + 5, &AutoCommit::default()).unwrap();
        cache.write(foo(2, "x"), FOREVER, &AutoCommit::default()).unwrap();

        cache.reaper.add_filter(Arc::new(Never));
        assert_eq!(cache.reap(now + 10), 0);

        let cache = open();
        cache.write(foo(1, "x"), now + 5, &AutoCommit::default()).unwrap();
        cache.write(foo(2, "x"), FOREVER, &AutoCommit::default()).unwrap();
        assert_eq!(cache.reap(now + 10), 1);
        assert_eq!(cache.instances(), 1);
    }

    #[test]
    fn test_delete_all() {
        let cache = open();
        for i in 0..10 {
            write(&cache, foo(i, "x"));
        }
        cache.sync().unwrap();
        for i in 10..15 {
            write(&cache, foo(i, "x"));
        }
        assert_eq!(cache.delete_all().unwrap(), 15);
        assert_eq!(cache.storage().num_entries().unwrap(), 0);
        assert!(read_all(&cache, &MangledEntry::new("Foo")).is_empty());
        assert_eq!(cache.instances(), 0);
    }

    #[test]
    fn test_long_template_agrees_before_and_after_flush() {
        let cache = open();
        let oid = write(&cache, foo(1, "x"));
        let valued_tail = MangledEntry::new("Foo")
            .with_null("a")
            .with_null("b")
            .with("c", 5i64);
        let null_tail = MangledEntry::new("Foo")
            .with_null("a")
            .with_null("b")
            .with_null("c");

        assert!(read_all(&cache, &valued_tail).is_empty());
        assert_eq!(read_all(&cache, &null_tail), vec![oid]);
        cache.sync().unwrap();
        assert!(read_all(&cache, &valued_tail).is_empty());
        assert_eq!(read_all(&cache, &null_tail), vec![oid]);
    }

    #[test]
    fn test_failed_flush_survives_eviction() {
        let disk = Arc::new(MemoryDisk::new());
        let mut config = config();
        config.storage.retry_attempts = 1;
        config.writer.threads = 1;
        config.writer.max_flush_attempts = 1;
        config.cache.cache_size = 4;
        config.cache.entries_per_partition = 4;
        let cache = open_on(disk.clone(), &config, "Foo");

        write(&cache, foo(0, "x"));
        cache.sync().unwrap();

        disk.inject_contention(1);
        let stuck = write(&cache, foo(1, "x"));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while cache.counters().failed_flushes == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(cache.counters().failed_flushes, 1);

        // Push the stuck sleeve out of the cache
        for i in 2..32 {
            write(&cache, foo(i, "x"));
        }
        assert_eq!(read_all(&cache, &by_a(1)), vec![stuck]);
        assert!(cache.get(stuck).unwrap().is_some());
        assert_eq!(cache.instances(), 32);

        // The parked write goes out on sync
        cache.sync().unwrap();
        assert_eq!(cache.storage().num_entries().unwrap(), 32);
        assert!(cache.storage().load(stuck).unwrap().is_some());
        assert_eq!(cache.counters().pending_flushes, 0);
    }

    #[test]
    fn test_pinned_writes_are_invisible_until_commit() {
        let cache = open();
        let txn = Transactional::new();
        let oid = cache.write(foo(1, "x"), FOREVER, &txn).unwrap().unwrap();
        assert!(read_all(&cache, &by_a(1)).is_empty());
        cache.sync().unwrap();
        assert!(cache.storage().load(oid).unwrap().is_none());

        assert!(cache.flush(oid).unwrap());
        assert_eq!(read_all(&cache, &by_a(1)), vec![oid]);
        cache.sync().unwrap();
        assert!(cache.storage().load(oid).unwrap().is_some());
    }

    #[test]
    fn test_aborted_write_disappears() {
        let cache = open();
        let oid = cache
            .write(foo(1, "x"), FOREVER, &Transactional::new())
            .unwrap()
            .unwrap();
        assert!(cache.abort_write(oid).unwrap());
        assert!(!cache.flush(oid).unwrap());
        assert!(read_all(&cache, &by_a(1)).is_empty());
        assert_eq!(cache.instances(), 0);
    }

    #[test]
    fn test_fifo_returns_write_order() {
        let mut config = config();
        config.entry.fifo_types = vec!["Foo".to_string()];
        config.entry.oid_zones = 4;
        let cache = open_on(Arc::new(MemoryDisk::new()), &config, "Foo");
        assert!(cache.is_fifo());

        let mut written = Vec::new();
        for i in 0..30 {
            written.push(write(&cache, foo(1, &format!("v{i}"))));
            if i == 10 {
                cache.sync().unwrap();
            }
        }

        for expected in written {
            assert_eq!(take(&cache, &by_a(1)), Some(expected));
        }
    }

    #[test]
    fn test_early_flush_deletes_immediately() {
        let mut config = config();
        config.entry.early_flush_on_take = true;
        let cache = open_on(Arc::new(MemoryDisk::new()), &config, "Foo");
        let oid = write(&cache, foo(1, "x"));
        cache.sync().unwrap();

        assert_eq!(take(&cache, &by_a(1)), Some(oid));
        assert!(cache.storage().load(oid).unwrap().is_none());
    }

    #[test]
    fn test_reopen_counts_disk_entries() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let config = config();
        {
            let cache = open_on(Arc::clone(&disk), &config, "Foo");
            for i in 0..7 {
                write(&cache, foo(i, "x"));
            }
            cache.shutdown().unwrap();
        }

        let cache = SleeveCache::open(
            TypeName::from("Foo"),
            disk,
            &config,
            SleeveCacheOptions {
                tracker: Arc::new(NullTracker),
                reaper: Arc::new(Reaper::new()),
                oplog: None,
                must_exist: true,
            },
        )
        .unwrap();
        assert_eq!(cache.instances(), 7);
        assert_eq!(read_all(&cache, &by_a(3)).len(), 1);
    }

    #[test]
    fn test_recover_skips_durable_entries() {
        let cache = open();
        let oid = write(&cache, foo(1, "x"));
        cache.sync().unwrap();
        let durable = cache.storage().load(oid).unwrap().unwrap();
        assert!(cache.recover(durable).unwrap().on_disk);
        assert_eq!(cache.instances(), 1);

        let lost = PersistentEntry::new(Oid::new(0, 50_000), foo(9, "y"), FOREVER);
        let summary = cache.recover(lost).unwrap();
        assert!(!summary.on_disk);
        assert_eq!(read_all(&cache, &by_a(9)), vec![Oid::new(0, 50_000)]);
        assert_eq!(cache.instances(), 2);
    }

    #[test]
    fn test_schema_mismatch_is_rejected() {
        let cache = open();
        write(&cache, foo(1, "x"));
        let err = cache
            .write(MangledEntry::new("Foo").with("a", 1i64), FOREVER, &AutoCommit::default())
            .unwrap_err();
        assert!(matches!(err, tuplespace_common::Error::SchemaMismatch { .. }));
    }

    #[test]
    fn test_concurrent_takes_take_each_entry_once() {
        let cache = open();
        for _ in 0..100 {
            write(&cache, foo(1, "x"));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(oid) = take(&cache, &by_a(1)) {
                        mine.push(oid);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<Oid> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 100);
        assert_eq!(all.len(), 100);
        cache.sync().unwrap();
        assert_eq!(cache.storage().num_entries().unwrap(), 0);
    }
}
