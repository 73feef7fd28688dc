//! Disk provider backed by redb.
//!
//! Primary tables are `&[u8] -> &[u8]` tables, duplicate tables are redb
//! multimap tables, whose values are kept sorted per key. redb serializes
//! writers, so this provider never reports contention itself.

use super::{Disk, DiskError, DiskResult, DiskTxn, TxnMode};
use redb::{
    Database, MultimapTableDefinition, ReadOnlyMultimapTable, ReadOnlyTable, ReadTransaction,
    ReadableMultimapTable, ReadableTable, TableDefinition, TableError, WriteTransaction,
};
use std::ops::Bound;
use std::path::Path;
use tracing::info;

type Bytes = &'static [u8];

impl From<redb::DatabaseError> for DiskError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Backend(format!("redb database error: {e}"))
    }
}

impl From<redb::TransactionError> for DiskError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Backend(format!("redb transaction error: {e}"))
    }
}

impl From<redb::TableError> for DiskError {
    fn from(e: redb::TableError) -> Self {
        Self::Backend(format!("redb table error: {e}"))
    }
}

impl From<redb::StorageError> for DiskError {
    fn from(e: redb::StorageError) -> Self {
        Self::Backend(format!("redb storage error: {e}"))
    }
}

impl From<redb::CommitError> for DiskError {
    fn from(e: redb::CommitError) -> Self {
        Self::Backend(format!("redb commit error: {e}"))
    }
}

fn table_def(name: &str) -> TableDefinition<'_, Bytes, Bytes> {
    TableDefinition::new(name)
}

fn dup_def(name: &str) -> MultimapTableDefinition<'_, Bytes, Bytes> {
    MultimapTableDefinition::new(name)
}

/// Persistent provider: one redb database file holds every table
pub struct RedbDisk {
    db: Database,
}

impl RedbDisk {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> DiskResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        info!("Opened redb disk at {:?}", path);
        Ok(Self { db })
    }
}

impl Disk for RedbDisk {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn begin(&self, mode: TxnMode) -> DiskResult<Box<dyn DiskTxn + '_>> {
        let inner = match mode {
            TxnMode::ReadOnly => Inner::Read(self.db.begin_read()?),
            TxnMode::Write => Inner::Write(self.db.begin_write()?),
        };
        Ok(Box::new(RedbTxn { inner }))
    }
}

enum Inner {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

struct RedbTxn {
    inner: Inner,
}

/// Open a table in a read transaction, a missing table reads as empty
fn open_read(txn: &ReadTransaction, name: &str) -> DiskResult<Option<ReadOnlyTable<Bytes, Bytes>>> {
    match txn.open_table(table_def(name)) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn open_read_dup(
    txn: &ReadTransaction,
    name: &str,
) -> DiskResult<Option<ReadOnlyMultimapTable<Bytes, Bytes>>> {
    match txn.open_multimap_table(dup_def(name)) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn get_in<T: ReadableTable<Bytes, Bytes>>(table: &T, key: &[u8]) -> DiskResult<Option<Vec<u8>>> {
    Ok(table.get(key)?.map(|v| v.value().to_vec()))
}

fn len_in<T: ReadableTable<Bytes, Bytes>>(table: &T) -> DiskResult<u64> {
    let mut count = 0u64;
    for item in table.iter()? {
        item?;
        count += 1;
    }
    Ok(count)
}

fn scan_in<T: ReadableTable<Bytes, Bytes>>(
    table: &T,
    after: Option<&[u8]>,
    limit: usize,
) -> DiskResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let lower: Bound<&[u8]> = after.map_or(Bound::Unbounded, Bound::Excluded);
    let mut out = Vec::new();
    for item in table.range::<&[u8]>((lower, Bound::<&[u8]>::Unbounded))? {
        if out.len() >= limit {
            break;
        }
        let (k, v) = item?;
        out.push((k.value().to_vec(), v.value().to_vec()));
    }
    Ok(out)
}

fn last_in<T: ReadableTable<Bytes, Bytes>>(table: &T) -> DiskResult<Option<Vec<u8>>> {
    Ok(table.last()?.map(|(k, _)| k.value().to_vec()))
}

fn dup_values_in<T: ReadableMultimapTable<Bytes, Bytes>>(
    table: &T,
    key: &[u8],
    after: Option<&[u8]>,
    limit: usize,
) -> DiskResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for item in table.get(key)? {
        if out.len() >= limit {
            break;
        }
        let value = item?.value().to_vec();
        if after.is_none_or(|a| value.as_slice() > a) {
            out.push(value);
        }
    }
    Ok(out)
}

impl RedbTxn {
    fn write_txn(&self) -> DiskResult<&WriteTransaction> {
        match &self.inner {
            Inner::Write(txn) => Ok(txn),
            Inner::Read(_) => Err(DiskError::Backend("write in read-only transaction".into())),
        }
    }
}

impl DiskTxn for RedbTxn {
    fn get(&self, table: &str, key: &[u8]) -> DiskResult<Option<Vec<u8>>> {
        match &self.inner {
            Inner::Read(txn) => match open_read(txn, table)? {
                Some(t) => get_in(&t, key),
                None => Ok(None),
            },
            Inner::Write(txn) => get_in(&txn.open_table(table_def(table))?, key),
        }
    }

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<()> {
        let txn = self.write_txn()?;
        let mut t = txn.open_table(table_def(table))?;
        t.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> DiskResult<bool> {
        let txn = self.write_txn()?;
        let mut t = txn.open_table(table_def(table))?;
        let existed = t.remove(key)?.is_some();
        Ok(existed)
    }

    fn len(&self, table: &str) -> DiskResult<u64> {
        match &self.inner {
            Inner::Read(txn) => match open_read(txn, table)? {
                Some(t) => len_in(&t),
                None => Ok(0),
            },
            Inner::Write(txn) => len_in(&txn.open_table(table_def(table))?),
        }
    }

    fn scan(
        &self,
        table: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> DiskResult<Vec<(Vec<u8>, Vec<u8>)>> {
        match &self.inner {
            Inner::Read(txn) => match open_read(txn, table)? {
                Some(t) => scan_in(&t, after, limit),
                None => Ok(Vec::new()),
            },
            Inner::Write(txn) => scan_in(&txn.open_table(table_def(table))?, after, limit),
        }
    }

    fn last_key(&self, table: &str) -> DiskResult<Option<Vec<u8>>> {
        match &self.inner {
            Inner::Read(txn) => match open_read(txn, table)? {
                Some(t) => last_in(&t),
                None => Ok(None),
            },
            Inner::Write(txn) => last_in(&txn.open_table(table_def(table))?),
        }
    }

    fn put_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<()> {
        let txn = self.write_txn()?;
        let mut t = txn.open_multimap_table(dup_def(table))?;
        t.insert(key, value)?;
        Ok(())
    }

    fn delete_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<bool> {
        let txn = self.write_txn()?;
        let mut t = txn.open_multimap_table(dup_def(table))?;
        let removed = t.remove(key, value)?;
        Ok(removed)
    }

    fn count_dup(&self, table: &str, key: &[u8]) -> DiskResult<u64> {
        Ok(self.scan_dup(table, key, None, usize::MAX)?.len() as u64)
    }

    fn scan_dup(
        &self,
        table: &str,
        key: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> DiskResult<Vec<Vec<u8>>> {
        match &self.inner {
            Inner::Read(txn) => match open_read_dup(txn, table)? {
                Some(t) => dup_values_in(&t, key, after, limit),
                None => Ok(Vec::new()),
            },
            Inner::Write(txn) => {
                dup_values_in(&txn.open_multimap_table(dup_def(table))?, key, after, limit)
            }
        }
    }

    fn commit(self: Box<Self>) -> DiskResult<()> {
        match self.inner {
            Inner::Write(txn) => txn.commit()?,
            Inner::Read(txn) => drop(txn),
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> DiskResult<()> {
        match self.inner {
            Inner::Write(txn) => txn.abort()?,
            Inner::Read(txn) => drop(txn),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_primary_roundtrip() {
        let dir = tempdir().unwrap();
        let disk = RedbDisk::open(dir.path().join("space.redb")).unwrap();

        let mut txn = disk.begin(TxnMode::Write).unwrap();
        txn.put("entries", b"k1", b"v1").unwrap();
        txn.put("entries", b"k2", b"v2").unwrap();
        txn.commit().unwrap();

        let txn = disk.begin(TxnMode::ReadOnly).unwrap();
        assert_eq!(txn.get("entries", b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(txn.len("entries").unwrap(), 2);
        assert_eq!(txn.last_key("entries").unwrap(), Some(b"k2".to_vec()));
        let page = txn.scan("entries", Some(b"k1"), 10).unwrap();
        assert_eq!(page, vec![(b"k2".to_vec(), b"v2".to_vec())]);
    }

    #[test]
    fn test_redb_missing_tables_read_empty() {
        let dir = tempdir().unwrap();
        let disk = RedbDisk::open(dir.path().join("space.redb")).unwrap();

        let txn = disk.begin(TxnMode::ReadOnly).unwrap();
        assert_eq!(txn.get("nope", b"k").unwrap(), None);
        assert_eq!(txn.count_dup("nope.idx", b"k").unwrap(), 0);
        assert!(txn.scan("nope", None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_redb_duplicates() {
        let dir = tempdir().unwrap();
        let disk = RedbDisk::open(dir.path().join("space.redb")).unwrap();

        let mut txn = disk.begin(TxnMode::Write).unwrap();
        for v in [b"c", b"a", b"b"] {
            txn.put_dup("idx", b"h", v).unwrap();
        }
        txn.commit().unwrap();

        let mut txn = disk.begin(TxnMode::Write).unwrap();
        assert!(txn.delete_dup("idx", b"h", b"b").unwrap());
        assert!(!txn.delete_dup("idx", b"h", b"b").unwrap());
        txn.commit().unwrap();

        let txn = disk.begin(TxnMode::ReadOnly).unwrap();
        assert_eq!(txn.count_dup("idx", b"h").unwrap(), 2);
        assert_eq!(
            txn.scan_dup("idx", b"h", Some(b"a"), 10).unwrap(),
            vec![b"c".to_vec()]
        );
    }

    #[test]
    fn test_redb_abort_discards() {
        let dir = tempdir().unwrap();
        let disk = RedbDisk::open(dir.path().join("space.redb")).unwrap();

        let mut txn = disk.begin(TxnMode::Write).unwrap();
        txn.put("entries", b"k", b"v").unwrap();
        txn.abort().unwrap();

        let txn = disk.begin(TxnMode::ReadOnly).unwrap();
        assert_eq!(txn.get("entries", b"k").unwrap(), None);
    }
}
