//! In-memory disk provider
//!
//! Write transactions buffer their operations and apply them atomically on
//! commit, reads inside a transaction see the transaction's own writes.
//! Contention can be injected so retry paths can be driven from tests.

use super::{ContentionError, Disk, DiskError, DiskResult, DiskTxn, TxnMode};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};

type Primary = BTreeMap<Vec<u8>, Vec<u8>>;
type Duplicates = BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>;

#[derive(Default)]
struct Tables {
    primary: HashMap<String, Primary>,
    dups: HashMap<String, Duplicates>,
}

/// Buffered write
#[derive(Debug, Clone)]
enum Op {
    Put {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
    PutDup {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteDup {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

/// Volatile provider backed by ordered maps
#[derive(Default)]
pub struct MemoryDisk {
    tables: RwLock<Tables>,
    /// Remaining write operations that will be refused with a deadlock
    injected: AtomicU32,
}

impl MemoryDisk {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` write operations with
    /// [`ContentionError::Deadlock`]
    pub fn inject_contention(&self, count: u32) {
        self.injected.fetch_add(count, Ordering::SeqCst);
    }

    /// Injected refusals not yet consumed
    pub fn pending_contention(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn check_contention(&self) -> DiskResult<()> {
        let refused = self
            .injected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            Err(ContentionError::Deadlock.into())
        } else {
            Ok(())
        }
    }
}

impl Disk for MemoryDisk {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(&self, mode: TxnMode) -> DiskResult<Box<dyn DiskTxn + '_>> {
        Ok(Box::new(MemoryTxn {
            disk: self,
            mode,
            ops: Vec::new(),
        }))
    }
}

struct MemoryTxn<'a> {
    disk: &'a MemoryDisk,
    mode: TxnMode,
    ops: Vec<Op>,
}

impl MemoryTxn<'_> {
    fn writable(&self) -> DiskResult<()> {
        if self.mode == TxnMode::ReadOnly {
            return Err(DiskError::Backend("write in read-only transaction".into()));
        }
        self.disk.check_contention()
    }

    /// Primary table as this transaction sees it, restricted to keys after
    /// `after`
    fn primary_view(&self, table: &str, after: Option<&[u8]>) -> Primary {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut view: Primary = {
            let tables = self.disk.tables.read();
            tables
                .primary
                .get(table)
                .map(|t| {
                    t.range::<[u8], _>((lower, Bound::Unbounded))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        for op in &self.ops {
            match op {
                Op::Put { table: t, key, value } if t == table && after_bound(key, after) => {
                    view.insert(key.clone(), value.clone());
                }
                Op::Delete { table: t, key } if t == table => {
                    view.remove(key);
                }
                _ => {}
            }
        }
        view
    }

    /// Values of one duplicate key as this transaction sees them
    fn dup_view(&self, table: &str, key: &[u8]) -> BTreeSet<Vec<u8>> {
        let mut view = {
            let tables = self.disk.tables.read();
            tables
                .dups
                .get(table)
                .and_then(|t| t.get(key))
                .cloned()
                .unwrap_or_default()
        };

        for op in &self.ops {
            match op {
                Op::PutDup {
                    table: t,
                    key: k,
                    value,
                } if t == table && k == key => {
                    view.insert(value.clone());
                }
                Op::DeleteDup {
                    table: t,
                    key: k,
                    value,
                } if t == table && k == key => {
                    view.remove(value);
                }
                _ => {}
            }
        }
        view
    }
}

fn after_bound(key: &[u8], after: Option<&[u8]>) -> bool {
    after.is_none_or(|a| key > a)
}

impl DiskTxn for MemoryTxn<'_> {
    fn get(&self, table: &str, key: &[u8]) -> DiskResult<Option<Vec<u8>>> {
        for op in self.ops.iter().rev() {
            match op {
                Op::Put {
                    table: t,
                    key: k,
                    value,
                } if t == table && k == key => return Ok(Some(value.clone())),
                Op::Delete { table: t, key: k } if t == table && k == key => return Ok(None),
                _ => {}
            }
        }
        let tables = self.disk.tables.read();
        Ok(tables.primary.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<()> {
        self.writable()?;
        self.ops.push(Op::Put {
            table: table.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> DiskResult<bool> {
        self.writable()?;
        let existed = self.get(table, key)?.is_some();
        self.ops.push(Op::Delete {
            table: table.to_string(),
            key: key.to_vec(),
        });
        Ok(existed)
    }

    fn len(&self, table: &str) -> DiskResult<u64> {
        Ok(self.primary_view(table, None).len() as u64)
    }

    fn scan(
        &self,
        table: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> DiskResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .primary_view(table, after)
            .into_iter()
            .take(limit)
            .collect())
    }

    fn last_key(&self, table: &str) -> DiskResult<Option<Vec<u8>>> {
        Ok(self
            .primary_view(table, None)
            .into_keys()
            .next_back())
    }

    fn put_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<()> {
        self.writable()?;
        self.ops.push(Op::PutDup {
            table: table.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn delete_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> DiskResult<bool> {
        self.writable()?;
        if !self.dup_view(table, key).contains(value) {
            return Ok(false);
        }
        self.ops.push(Op::DeleteDup {
            table: table.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(true)
    }

    fn count_dup(&self, table: &str, key: &[u8]) -> DiskResult<u64> {
        Ok(self.dup_view(table, key).len() as u64)
    }

    fn scan_dup(
        &self,
        table: &str,
        key: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> DiskResult<Vec<Vec<u8>>> {
        Ok(self
            .dup_view(table, key)
            .into_iter()
            .filter(|v| after_bound(v, after))
            .take(limit)
            .collect())
    }

    fn commit(self: Box<Self>) -> DiskResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let mut tables = self.disk.tables.write();
        for op in self.ops {
            match op {
                Op::Put { table, key, value } => {
                    tables.primary.entry(table).or_default().insert(key, value);
                }
                Op::Delete { table, key } => {
                    if let Some(t) = tables.primary.get_mut(&table) {
                        t.remove(&key);
                    }
                }
                Op::PutDup { table, key, value } => {
                    tables
                        .dups
                        .entry(table)
                        .or_default()
                        .entry(key)
                        .or_default()
                        .insert(value);
                }
                Op::DeleteDup { table, key, value } => {
                    if let Some(t) = tables.dups.get_mut(&table) {
                        if let Some(values) = t.get_mut(&key) {
                            values.remove(&value);
                            if values.is_empty() {
                                t.remove(&key);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> DiskResult<()> {
        Ok(())
    }
}
