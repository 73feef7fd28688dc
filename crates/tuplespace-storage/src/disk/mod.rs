//! Transactional key-value provider
//!
//! Storage never talks to a database directly. It opens [`DiskTxn`]s on a
//! [`Disk`], which offers two table shapes:
//!
//! - **primary tables**: unique byte keys to byte values
//! - **duplicate tables**: a key maps to a sorted set of values (secondary
//!   indexes: field hash to OIDs)
//!
//! Lock contention is reported as [`DiskError::Contention`] and is the only
//! error [`retry_on_contention`] retries.

mod memory;
mod redb_disk;
mod retry;

pub use memory::MemoryDisk;
pub use redb_disk::RedbDisk;
pub use retry::{retry_on_contention, retrying_update, RetryPolicy};

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tuplespace_common::Error;

/// Result type for disk operations
pub type DiskResult<T> = std::result::Result<T, DiskError>;

/// Lock manager refusals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContentionError {
    #[error("deadlock detected")]
    Deadlock,
    #[error("lock not granted")]
    LockNotGranted,
}

/// Disk provider error
#[derive(Debug, Error)]
pub enum DiskError {
    #[error(transparent)]
    Contention(#[from] ContentionError),

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiskError {
    /// Whether the operation may succeed if simply retried
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Normalize into the engine error, keeping this error as the cause
    pub fn context(self, context: impl Into<String>) -> Error {
        match self {
            Self::Aborted(_) => Error::aborted_with(context, self),
            other => Error::storage_with(context, other),
        }
    }
}

impl From<DiskError> for Error {
    fn from(e: DiskError) -> Self {
        e.context("disk operation failed")
    }
}

/// Transaction flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Snapshot reads only
    ReadOnly,
    /// Reads and writes, applied atomically on commit
    Write,
}

/// A key-value store offering transactions over named tables
pub trait Disk: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Start a transaction
    fn begin(&self, mode: TxnMode) -> DiskResult<Box<dyn DiskTxn + '_>>;
}

/// One transaction. Dropping it without [`DiskTxn::commit`] aborts it.
///
/// Reading a table that was never written behaves as reading an empty table.
pub trait DiskTxn {
    /// Point lookup in a primary table
    fn get(&self, table: &str, key: &[u8]) -> DiskResult<Option<Vec<u8>>>;

    /// Insert or replace in a primary table
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<()>;

    /// Remove from a primary table, returning whether the key existed
    fn delete(&mut self, table: &str, key: &[u8]) -> DiskResult<bool>;

    /// Number of keys in a primary table
    fn len(&self, table: &str) -> DiskResult<u64>;

    /// Up to `limit` entries with keys strictly greater than `after`
    fn scan(
        &self,
        table: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> DiskResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Largest key in a primary table
    fn last_key(&self, table: &str) -> DiskResult<Option<Vec<u8>>>;

    /// Add a value to a duplicate key
    fn put_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<()>;

    /// Find the exact `(key, value)` pair and remove it, returning whether it
    /// was present
    fn delete_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<bool>;

    /// Number of values stored under a duplicate key
    fn count_dup(&self, table: &str, key: &[u8]) -> DiskResult<u64>;

    /// Up to `limit` values of a duplicate key strictly greater than `after`
    fn scan_dup(
        &self,
        table: &str,
        key: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> DiskResult<Vec<Vec<u8>>>;

    /// Make all writes durable and visible
    fn commit(self: Box<Self>) -> DiskResult<()>;

    /// Discard all writes
    fn abort(self: Box<Self>) -> DiskResult<()>;
}

/// What a [`Cursor`] walks
#[derive(Debug, Clone)]
enum CursorSource {
    /// Keys of a primary table
    Table { table: String },
    /// Values under one duplicate key
    Dup { table: String, key: Vec<u8> },
}

/// Page-at-a-time cursor.
///
/// Each page is read in its own short read-only transaction, so a slow
/// consumer never pins a snapshot. Entries inserted behind the cursor's
/// position are not seen; entries inserted ahead of it are.
pub struct Cursor {
    disk: Arc<dyn Disk>,
    source: CursorSource,
    after: Option<Vec<u8>>,
    page: VecDeque<Vec<u8>>,
    page_size: usize,
    exhausted: bool,
}

impl Cursor {
    /// Cursor over the keys of a primary table
    pub fn table(disk: Arc<dyn Disk>, table: impl Into<String>, page_size: usize) -> Self {
        Self::new(
            disk,
            CursorSource::Table {
                table: table.into(),
            },
            page_size,
        )
    }

    /// Cursor over the values stored under one duplicate key
    pub fn dup(
        disk: Arc<dyn Disk>,
        table: impl Into<String>,
        key: &[u8],
        page_size: usize,
    ) -> Self {
        Self::new(
            disk,
            CursorSource::Dup {
                table: table.into(),
                key: key.to_vec(),
            },
            page_size,
        )
    }

    fn new(disk: Arc<dyn Disk>, source: CursorSource, page_size: usize) -> Self {
        Self {
            disk,
            source,
            after: None,
            page: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> DiskResult<()> {
        let txn = self.disk.begin(TxnMode::ReadOnly)?;
        let after = self.after.as_deref();
        let page: Vec<Vec<u8>> = match &self.source {
            CursorSource::Table { table } => txn
                .scan(table, after, self.page_size)?
                .into_iter()
                .map(|(k, _)| k)
                .collect(),
            CursorSource::Dup { table, key } => txn.scan_dup(table, key, after, self.page_size)?,
        };
        txn.abort()?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.clone());
        }
        self.page.extend(page);
        Ok(())
    }
}

impl Iterator for Cursor {
    type Item = DiskResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Arc<dyn Disk> {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let mut txn = disk.begin(TxnMode::Write).unwrap();
        for i in 0u32..10 {
            txn.put("t", &i.to_be_bytes(), b"v").unwrap();
            txn.put_dup("d", b"k", &i.to_be_bytes()).unwrap();
        }
        txn.commit().unwrap();
        disk
    }

    #[test]
    fn test_table_cursor_pages_through_everything() {
        let disk = populated();
        let keys: Vec<Vec<u8>> = Cursor::table(disk, "t", 3)
            .collect::<DiskResult<_>>()
            .unwrap();
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0], 0u32.to_be_bytes().to_vec());
        assert_eq!(keys[9], 9u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_dup_cursor_exact_page_boundary() {
        let disk = populated();
        let values: Vec<Vec<u8>> = Cursor::dup(disk, "d", b"k", 5)
            .collect::<DiskResult<_>>()
            .unwrap();
        assert_eq!(values.len(), 10);
    }

    #[test]
    fn test_cursor_on_missing_table_is_empty() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        assert_eq!(Cursor::table(disk, "nothing", 4).count(), 0);
    }

    #[test]
    fn test_disk_error_context_keeps_kind() {
        let err = DiskError::Aborted("victim".into()).context("write Foo");
        assert!(matches!(err, Error::Aborted { .. }));

        let err: Error = DiskError::Contention(ContentionError::Deadlock).into();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(err.is_io_failure());
    }
}
