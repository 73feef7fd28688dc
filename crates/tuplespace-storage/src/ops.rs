//! Search visitors, operation records and write escorts

use crate::codec::{MangledEntry, PersistentEntry};
use crate::context::RepositoryContext;
use crate::oplog::{LogRecord, OpLog};
use crate::repository::EntryRepository;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use tuplespace_common::{Oid, Result, TypeName};

/// A visitor's verdict on one offered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResponse {
    /// Not this one, keep searching
    TryAgain,
    /// End the search without accepting
    Stop,
    /// Take (or read) this entry and end the search
    Accepted,
}

impl SearchResponse {
    pub fn is_terminal(self) -> bool {
        self != Self::TryAgain
    }
}

/// A live, matching entry offered to a visitor
pub struct SearchOffer<'a> {
    type_name: &'a TypeName,
    entry: &'a PersistentEntry,
}

impl<'a> SearchOffer<'a> {
    pub(crate) fn new(type_name: &'a TypeName, entry: &'a PersistentEntry) -> Self {
        Self { type_name, entry }
    }

    pub fn oid(&self) -> Oid {
        self.entry.oid()
    }

    pub fn expiry(&self) -> u64 {
        self.entry.expiry()
    }

    pub fn type_name(&self) -> &TypeName {
        self.type_name
    }

    pub fn entry(&self) -> Result<&MangledEntry> {
        self.entry.entry()
    }
}

/// Receives candidate entries during a search
pub trait SearchVisitor {
    fn offer(&mut self, offer: &SearchOffer<'_>) -> SearchResponse;

    /// Whether an accepted entry is removed from the space
    fn is_deleter(&self) -> bool {
        false
    }
}

/// Visitor collecting up to `limit` entries
#[derive(Debug)]
pub struct Collector {
    limit: usize,
    deleter: bool,
    found: Vec<(Oid, MangledEntry)>,
}

impl Collector {
    pub fn read_one() -> Self {
        Self {
            limit: 1,
            deleter: false,
            found: Vec::new(),
        }
    }

    pub fn take_one() -> Self {
        Self {
            limit: 1,
            deleter: true,
            found: Vec::new(),
        }
    }

    pub fn read_all() -> Self {
        Self {
            limit: usize::MAX,
            deleter: false,
            found: Vec::new(),
        }
    }

    pub fn found(&self) -> &[(Oid, MangledEntry)] {
        &self.found
    }

    pub fn into_found(self) -> Vec<(Oid, MangledEntry)> {
        self.found
    }

    pub fn first(&self) -> Option<&(Oid, MangledEntry)> {
        self.found.first()
    }
}

impl SearchVisitor for Collector {
    fn offer(&mut self, offer: &SearchOffer<'_>) -> SearchResponse {
        match offer.entry() {
            Ok(entry) => self.found.push((offer.oid(), entry.clone())),
            Err(e) => {
                warn!("Skipping undecodable {}: {}", offer.oid(), e);
                return SearchResponse::TryAgain;
            }
        }
        if self.found.len() >= self.limit {
            SearchResponse::Accepted
        } else {
            SearchResponse::TryAgain
        }
    }

    fn is_deleter(&self) -> bool {
        self.deleter
    }
}

/// A space operation that can be logged, committed, aborted and replayed
pub trait OpInfo: Send + Sync {
    fn oid(&self) -> Oid;

    fn type_name(&self) -> &TypeName;

    /// Log form of this operation
    fn record(&self) -> Result<LogRecord>;

    /// Make the operation's effect final
    fn commit(&self, repo: &EntryRepository) -> Result<()>;

    /// Undo an uncommitted operation
    fn abort(&self, repo: &EntryRepository) -> Result<()>;

    /// Reapply the operation during log replay
    fn restore(&self, repo: &EntryRepository) -> Result<()>;
}

/// A write of one entry
#[derive(Debug, Clone)]
pub struct WriteOp {
    type_name: TypeName,
    entry: PersistentEntry,
}

impl WriteOp {
    pub fn new(type_name: TypeName, entry: PersistentEntry) -> Self {
        Self { type_name, entry }
    }

    pub fn entry(&self) -> &PersistentEntry {
        &self.entry
    }
}

impl OpInfo for WriteOp {
    fn oid(&self) -> Oid {
        self.entry.oid()
    }

    fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    fn record(&self) -> Result<LogRecord> {
        Ok(LogRecord::Write {
            type_name: self.type_name.clone(),
            oid: self.entry.oid(),
            entry: self.entry.flatten()?,
        })
    }

    fn commit(&self, repo: &EntryRepository) -> Result<()> {
        if !repo.flush(self.oid())? {
            debug!("Commit of {}: nothing pinned", self.oid());
        }
        Ok(())
    }

    fn abort(&self, repo: &EntryRepository) -> Result<()> {
        repo.abort_write(self.oid()).map(|_| ())
    }

    fn restore(&self, repo: &EntryRepository) -> Result<()> {
        repo.recover(self.entry.duplicate()).map(|_| ())
    }
}

/// A take of one entry
#[derive(Debug, Clone)]
pub struct TakeOp {
    type_name: TypeName,
    oid: Oid,
}

impl TakeOp {
    pub fn new(type_name: TypeName, oid: Oid) -> Self {
        Self { type_name, oid }
    }
}

impl OpInfo for TakeOp {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    fn record(&self) -> Result<LogRecord> {
        Ok(LogRecord::Take {
            type_name: self.type_name.clone(),
            oid: self.oid,
        })
    }

    fn commit(&self, repo: &EntryRepository) -> Result<()> {
        repo.remove(self.oid).map(|_| ())
    }

    fn abort(&self, _repo: &EntryRepository) -> Result<()> {
        Ok(())
    }

    fn restore(&self, repo: &EntryRepository) -> Result<()> {
        repo.replay_take(self.oid).map(|_| ())
    }
}

/// A lease change of one entry
#[derive(Debug, Clone)]
pub struct RenewOp {
    type_name: TypeName,
    oid: Oid,
    expiry: u64,
}

impl RenewOp {
    pub fn new(type_name: TypeName, oid: Oid, expiry: u64) -> Self {
        Self {
            type_name,
            oid,
            expiry,
        }
    }
}

impl OpInfo for RenewOp {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    fn record(&self) -> Result<LogRecord> {
        Ok(LogRecord::Renew {
            type_name: self.type_name.clone(),
            oid: self.oid,
            expiry: self.expiry,
        })
    }

    fn commit(&self, repo: &EntryRepository) -> Result<()> {
        repo.renew_until(self.oid, self.expiry).map(|_| ())
    }

    fn abort(&self, _repo: &EntryRepository) -> Result<()> {
        Ok(())
    }

    fn restore(&self, repo: &EntryRepository) -> Result<()> {
        repo.replay_renew(self.oid, self.expiry).map(|_| ())
    }
}

impl LogRecord {
    /// Replayable operation for this record. Instance counts carry no
    /// operation.
    pub fn into_op(self) -> Result<Option<Box<dyn OpInfo>>> {
        Ok(Some(match self {
            Self::Write {
                type_name, entry, ..
            } => Box::new(WriteOp::new(type_name, PersistentEntry::from_bytes(&entry)?)),
            Self::Take { type_name, oid } => Box::new(TakeOp::new(type_name, oid)),
            Self::Renew {
                type_name,
                oid,
                expiry,
            } => Box::new(RenewOp::new(type_name, oid, expiry)),
            Self::InstanceCount { .. } => return Ok(None),
        }))
    }
}

/// Gate every write passes through before it becomes visible
pub trait WriteEscort: Send + Sync {
    /// Returns false to abandon the write
    fn writing(&self, op: &WriteOp) -> Result<bool>;

    /// Whether written sleeves stay pinned until an explicit commit
    fn pins(&self) -> bool {
        false
    }
}

/// Escort for writes that commit immediately
#[derive(Default, Clone)]
pub struct AutoCommit {
    log: Option<Arc<OpLog>>,
}

impl AutoCommit {
    pub fn new(log: Option<Arc<OpLog>>) -> Self {
        Self { log }
    }
}

impl WriteEscort for AutoCommit {
    fn writing(&self, op: &WriteOp) -> Result<bool> {
        if let Some(log) = &self.log {
            log.append(&op.record()?)?;
        }
        Ok(true)
    }
}

/// Escort grouping writes into one unit that commits or aborts together.
///
/// Written sleeves stay pinned, invisible to searches and never flushed,
/// until [`commit`](Self::commit).
#[derive(Default)]
pub struct Transactional {
    ops: Mutex<Vec<WriteOp>>,
    closed: AtomicBool,
}

impl Transactional {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self) -> Vec<WriteOp> {
        self.closed.store(true, Ordering::SeqCst);
        std::mem::take(&mut *self.ops.lock())
    }

    /// Log and unpin every write. The first failure stops the commit.
    pub fn commit(&self, ctx: &RepositoryContext) -> Result<usize> {
        let ops = self.close();
        for op in &ops {
            let repo = ctx.get_or_create(op.type_name())?;
            if let Some(log) = ctx.oplog() {
                log.append(&op.record()?)?;
            }
            op.commit(&repo)?;
        }
        debug!("Committed {} writes", ops.len());
        Ok(ops.len())
    }

    /// Discard every write
    pub fn abort(&self, ctx: &RepositoryContext) -> Result<usize> {
        let ops = self.close();
        for op in &ops {
            if let Some(repo) = ctx.repository(op.type_name()) {
                op.abort(&repo)?;
            }
        }
        debug!("Aborted {} writes", ops.len());
        Ok(ops.len())
    }
}

impl WriteEscort for Transactional {
    fn writing(&self, op: &WriteOp) -> Result<bool> {
        let mut ops = self.ops.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        ops.push(op.clone());
        Ok(true)
    }

    fn pins(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuplespace_common::FOREVER;

    fn entry(id: u64) -> PersistentEntry {
        PersistentEntry::new(Oid::new(0, id), MangledEntry::new("Foo").with("a", 1i64), FOREVER)
    }

    #[test]
    fn test_collector_limits() {
        let foo = TypeName::from("Foo");
        let (one, two) = (entry(1), entry(2));

        let mut reader = Collector::read_one();
        assert_eq!(reader.offer(&SearchOffer::new(&foo, &one)), SearchResponse::Accepted);
        assert!(!reader.is_deleter());

        let mut all = Collector::read_all();
        assert_eq!(all.offer(&SearchOffer::new(&foo, &one)), SearchResponse::TryAgain);
        assert_eq!(all.offer(&SearchOffer::new(&foo, &two)), SearchResponse::TryAgain);
        assert_eq!(all.found().len(), 2);

        assert!(Collector::take_one().is_deleter());
    }

    #[test]
    fn test_records_convert_back_to_ops() {
        let write = WriteOp::new(TypeName::from("Foo"), entry(4));
        let op = write.record().unwrap().into_op().unwrap().unwrap();
        assert_eq!(op.oid(), Oid::new(0, 4));
        assert_eq!(op.type_name(), &TypeName::from("Foo"));

        let count = LogRecord::InstanceCount {
            type_name: TypeName::from("Foo"),
            count: 3,
        };
        assert!(count.into_op().unwrap().is_none());
    }

    #[test]
    fn test_closed_transaction_refuses_writes() {
        let txn = Transactional::new();
        let op = WriteOp::new(TypeName::from("Foo"), entry(1));
        assert!(txn.writing(&op).unwrap());
        assert!(txn.pins());
        assert_eq!(txn.close().len(), 1);
        assert!(!txn.writing(&op).unwrap());
    }
}
