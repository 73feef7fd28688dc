//! Tuplespace Storage - Entry storage engine
//!
//! This crate implements the persistent side of a tuple space:
//! - Entry encoding (mangled entries, persistent entries)
//! - Transactional key-value disks (redb, in-memory)
//! - Per-type storage with field hash indexes and search planning
//! - Partitioned ARC sleeve cache with write-back scheduling
//! - Lease tracking and reaping
//! - Operation log with replay
//! - Entry repositories and the context that owns them

pub mod allocator;
pub mod cache;
pub mod codec;
pub mod context;
pub mod counters;
pub mod dirty;
pub mod disk;
pub mod index;
pub mod indexer;
pub mod lease;
pub mod locator;
pub mod oplog;
pub mod ops;
pub mod repository;
pub mod sleeve;
pub mod sleeve_cache;
pub mod storage;
pub mod writer;

// Re-exports
pub use cache::{
    ArcCache, CacheBlock, CacheBlockDescriptor, CacheListener, CacheStatsSnapshot,
    PartitionedCache, RecoverySummary,
};
pub use codec::{MangledEntry, MangledField, PersistentEntry, Value};
pub use context::RepositoryContext;
pub use counters::CounterSnapshot;
pub use disk::{Disk, DiskError, DiskTxn, MemoryDisk, RedbDisk, RetryPolicy, TxnMode};
pub use lease::{ExpiryTracker, LeaseTracker, NullTracker, ReapFilter, ReapOutcome, Reaper};
pub use oplog::{LogRecord, OpLog};
pub use ops::{
    AutoCommit, Collector, OpInfo, SearchOffer, SearchResponse, SearchVisitor, Transactional,
    WriteEscort,
};
pub use repository::EntryRepository;
pub use sleeve::EntrySleeve;
pub use sleeve_cache::{SleeveCache, SleeveCacheOptions};
pub use storage::{SearchPlan, Storage};
pub use writer::{EntryEditor, FlushObserver, WriteScheduler};
