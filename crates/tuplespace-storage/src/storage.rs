//! Per-type on-disk table and search planner
//!
//! Each entry type owns:
//!
//! - `{type}.entries`: OID -> flattened [`PersistentEntry`]
//! - `{type}.meta`: schema, subtypes and OID reservations
//! - `{type}.idx.{n}`: one [`KeyIndex`] per field, in field order
//!
//! Writes index every field (last to first) before the primary row goes in;
//! deletes remove the primary row before unindexing. A crash in between can
//! leave an index pointing at nothing, never a row without index coverage.

use crate::codec::{MangledEntry, PersistentEntry};
use crate::dirty::DirtyBuffer;
use crate::disk::{retrying_update, Cursor, Disk, DiskResult, DiskTxn, RetryPolicy, TxnMode};
use crate::index::KeyIndex;
use crate::locator::{BoxedLocator, CursorLocator, VecLocator};
use crate::writer::EntryEditor;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tuplespace_common::config::StorageConfig;
use tuplespace_common::{Error, Oid, Result, TypeName};

const FIELDS_KEY: &[u8] = b"fields";
const SUBTYPES_KEY: &[u8] = b"subtypes";

/// Outcome of probing a template's fields against the indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPlan {
    /// No non-null field: every entry is a candidate
    Wildcard,
    /// Some field has no hits at all
    NoMatchPossible,
    /// Cheapest index to drive the search from
    Candidates { index: usize, hash: u32, count: u64 },
}

struct Schema {
    fields: Vec<String>,
    indexes: Vec<KeyIndex>,
}

/// Disk table for one entry type
pub struct Storage {
    type_name: TypeName,
    disk: Arc<dyn Disk>,
    policy: RetryPolicy,
    page_size: usize,
    primary: String,
    meta: String,
    schema: RwLock<Option<Arc<Schema>>>,
    subtypes: RwLock<BTreeSet<TypeName>>,
    dirty: Arc<DirtyBuffer>,
    lookups: AtomicU64,
}

impl Storage {
    /// Storage for `type_name`; call [`Storage::init`] before use
    pub fn new(
        type_name: TypeName,
        disk: Arc<dyn Disk>,
        config: &StorageConfig,
        dirty: Arc<DirtyBuffer>,
    ) -> Self {
        Self {
            primary: format!("{type_name}.entries"),
            meta: format!("{type_name}.meta"),
            type_name,
            disk,
            policy: RetryPolicy::from(config),
            page_size: config.scan_page_size,
            schema: RwLock::new(None),
            subtypes: RwLock::new(BTreeSet::new()),
            dirty,
            lookups: AtomicU64::new(0),
        }
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    /// Load schema and subtypes from disk. With `must_exist`, a type that was
    /// never written is an error. Returns whether a schema was found.
    pub fn init(&self, must_exist: bool) -> Result<bool> {
        let txn = self.disk.begin(TxnMode::ReadOnly)?;
        let fields = txn.get(&self.meta, FIELDS_KEY)?;
        let subtypes = txn.get(&self.meta, SUBTYPES_KEY)?;
        txn.abort()?;

        if let Some(bytes) = subtypes {
            let names: Vec<String> = decode(&bytes, "subtypes")?;
            self.subtypes
                .write()
                .extend(names.into_iter().map(TypeName::from));
        }

        match fields {
            Some(bytes) => {
                let fields: Vec<String> = decode(&bytes, "fields")?;
                info!(
                    "Opened storage for {} with {} fields",
                    self.type_name,
                    fields.len()
                );
                *self.schema.write() = Some(Arc::new(self.build_schema(fields)));
                Ok(true)
            }
            None if must_exist => Err(Error::UnknownType(self.type_name.to_string())),
            None => Ok(false),
        }
    }

    fn build_schema(&self, fields: Vec<String>) -> Schema {
        let indexes = (0..fields.len())
            .map(|i| {
                KeyIndex::new(
                    Arc::clone(&self.disk),
                    format!("{}.idx.{}", self.type_name, i),
                    i,
                    self.policy,
                    self.page_size,
                )
            })
            .collect();
        Schema { fields, indexes }
    }

    /// Fix the field list. Repeating the same list is a no-op, a different
    /// list is rejected.
    pub fn set_fields(&self, fields: &[String]) -> Result<()> {
        if self
            .schema
            .read()
            .as_ref()
            .is_some_and(|s| s.fields == fields)
        {
            return Ok(());
        }

        let mut schema = self.schema.write();
        if let Some(existing) = schema.as_ref() {
            if existing.fields == fields {
                return Ok(());
            }
            warn!(
                "Schema change for {} refused: {:?} -> {:?}",
                self.type_name, existing.fields, fields
            );
            return Err(Error::SchemaMismatch {
                type_name: self.type_name.to_string(),
                stored: existing.fields.len(),
                given: fields.len(),
            });
        }

        let bytes = encode(&fields.to_vec())?;
        retrying_update(self.disk.as_ref(), &self.policy, "set fields", |txn| {
            txn.put(&self.meta, FIELDS_KEY, &bytes)
        })
        .map_err(|e| e.context(format!("set fields of {}", self.type_name)))?;

        info!("Defined {} with fields {:?}", self.type_name, fields);
        *schema = Some(Arc::new(self.build_schema(fields.to_vec())));
        Ok(())
    }

    /// Field names, once defined
    pub fn fields(&self) -> Option<Vec<String>> {
        self.schema.read().as_ref().map(|s| s.fields.clone())
    }

    fn schema(&self) -> Result<Arc<Schema>> {
        self.schema
            .read()
            .clone()
            .ok_or_else(|| Error::UnknownType(self.type_name.to_string()))
    }

    /// Read one entry from disk
    pub fn load(&self, oid: Oid) -> Result<Option<PersistentEntry>> {
        let txn = self.disk.begin(TxnMode::ReadOnly)?;
        let bytes = txn.get(&self.primary, &oid.to_bytes())?;
        txn.abort()?;
        bytes.map(|b| PersistentEntry::from_bytes(&b)).transpose()
    }

    /// Choose how to search for `template`.
    ///
    /// Looks up each non-null field's index in order, stopping at the first
    /// field with no hits, and picks the field with the fewest hits (first
    /// one on ties).
    pub fn plan(&self, template: &MangledEntry) -> Result<SearchPlan> {
        if template.is_wildcard() {
            return Ok(SearchPlan::Wildcard);
        }
        let Some(schema) = self.schema.read().clone() else {
            return Ok(SearchPlan::NoMatchPossible);
        };

        if template.field_count() > schema.fields.len() {
            warn!(
                "Template for {} has {} fields, schema has {}",
                self.type_name,
                template.field_count(),
                schema.fields.len()
            );
            // No stored entry carries a value for a field past the schema
            if (schema.fields.len()..template.field_count())
                .any(|i| !template.is_null(i))
            {
                return Ok(SearchPlan::NoMatchPossible);
            }
        }

        let mut best: Option<(usize, u32, u64)> = None;
        for index in &schema.indexes {
            let Some(hash) = template.field_hash(index.offset()) else {
                continue;
            };
            self.lookups.fetch_add(1, Ordering::Relaxed);
            let count = index.count(hash)?;
            if count == 0 {
                debug!(
                    "Plan for {}: field {} has no hits",
                    self.type_name,
                    index.offset()
                );
                return Ok(SearchPlan::NoMatchPossible);
            }
            if best.is_none_or(|(_, _, c)| count < c) {
                best = Some((index.offset(), hash, count));
            }
        }

        Ok(match best {
            Some((index, hash, count)) => {
                debug!(
                    "Plan for {}: drive from field {} ({} candidates)",
                    self.type_name, index, count
                );
                SearchPlan::Candidates { index, hash, count }
            }
            None => SearchPlan::Wildcard,
        })
    }

    /// Candidate locator on disk, `None` when nothing can match
    pub fn find(&self, template: &MangledEntry) -> Result<Option<BoxedLocator>> {
        match self.plan(template)? {
            SearchPlan::NoMatchPossible => Ok(None),
            SearchPlan::Wildcard => Ok(Some(Box::new(self.scan_all()))),
            SearchPlan::Candidates { index, hash, .. } => {
                let schema = self.schema()?;
                Ok(Some(Box::new(schema.indexes[index].new_cursor(hash))))
            }
        }
    }

    /// Candidates among writes still waiting for the write scheduler
    pub fn find_cached(&self, template: &MangledEntry) -> Option<BoxedLocator> {
        let oids = self.dirty.matching(template);
        if oids.is_empty() {
            None
        } else {
            Some(Box::new(VecLocator::new(oids)))
        }
    }

    /// Ascending cursor over every stored OID
    pub fn scan_all(&self) -> CursorLocator {
        CursorLocator::new(Cursor::table(
            Arc::clone(&self.disk),
            self.primary.clone(),
            self.page_size,
        ))
    }

    /// Visit every stored entry, a page at a time
    pub fn for_each_entry(&self, mut f: impl FnMut(PersistentEntry) -> Result<()>) -> Result<()> {
        let mut after: Option<Vec<u8>> = None;
        loop {
            let txn = self.disk.begin(TxnMode::ReadOnly)?;
            let page = txn.scan(&self.primary, after.as_deref(), self.page_size)?;
            txn.abort()?;

            let done = page.len() < self.page_size;
            for (key, value) in page {
                f(PersistentEntry::from_bytes(&value)?)?;
                after = Some(key);
            }
            if done {
                return Ok(());
            }
        }
    }

    /// Record `subtype` as a subtype of this type
    pub fn add_subtype(&self, subtype: &TypeName) -> Result<bool> {
        let mut subtypes = self.subtypes.write();
        if !subtypes.insert(subtype.clone()) {
            return Ok(false);
        }

        let names: Vec<String> = subtypes.iter().map(ToString::to_string).collect();
        let bytes = encode(&names)?;
        let stored = retrying_update(self.disk.as_ref(), &self.policy, "add subtype", |txn| {
            txn.put(&self.meta, SUBTYPES_KEY, &bytes)
        });
        if let Err(e) = stored {
            subtypes.remove(subtype);
            return Err(e.context(format!("add subtype {subtype} to {}", self.type_name)));
        }

        info!("Recorded {} as subtype of {}", subtype, self.type_name);
        Ok(true)
    }

    pub fn subtypes(&self) -> Vec<TypeName> {
        self.subtypes.read().iter().cloned().collect()
    }

    /// Entries on disk
    pub fn num_entries(&self) -> Result<u64> {
        let txn = self.disk.begin(TxnMode::ReadOnly)?;
        let n = txn.len(&self.primary)?;
        txn.abort()?;
        Ok(n)
    }

    /// Persisted OID reservation limit of `zone`
    pub fn oid_limit(&self, zone: u32) -> Result<u64> {
        let txn = self.disk.begin(TxnMode::ReadOnly)?;
        let bytes = txn.get(&self.meta, &oid_limit_key(zone))?;
        txn.abort()?;
        Ok(bytes
            .and_then(|b| <[u8; 8]>::try_from(b.as_slice()).ok())
            .map_or(0, u64::from_be_bytes))
    }

    /// Persist a new OID reservation limit for `zone`
    pub fn set_oid_limit(&self, zone: u32, limit: u64) -> Result<()> {
        let key = oid_limit_key(zone);
        retrying_update(self.disk.as_ref(), &self.policy, "reserve oids", |txn| {
            txn.put(&self.meta, &key, &limit.to_be_bytes())
        })
        .map_err(|e| e.context(format!("reserve OIDs for {}", self.type_name)))
    }

    /// Index lookups issued by the planner so far
    pub fn index_lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Index tables, in field order
    pub fn index_tables(&self) -> Vec<String> {
        self.schema
            .read()
            .as_ref()
            .map(|s| s.indexes.iter().map(|i| i.table().to_string()).collect())
            .unwrap_or_default()
    }

    fn index_all(
        schema: &Schema,
        txn: &mut dyn DiskTxn,
        oid: Oid,
        entry: &MangledEntry,
    ) -> DiskResult<()> {
        for index in schema.indexes.iter().rev() {
            index.index(txn, oid, entry)?;
        }
        Ok(())
    }
}

impl EntryEditor for Storage {
    fn write(&self, entry: &PersistentEntry) -> Result<()> {
        let schema = self.schema()?;
        let oid = entry.oid();
        let fields = entry.entry()?;
        let key = oid.to_bytes();
        let value = entry.flatten()?;

        let what = format!("write {} {}", self.type_name, oid);
        retrying_update(self.disk.as_ref(), &self.policy, &what, |txn| {
            Self::index_all(&schema, txn, oid, fields)?;
            txn.put(&self.primary, &key, &value)
        })
        .map_err(|e| e.context(what.clone()))
    }

    fn update(&self, entry: &PersistentEntry) -> Result<()> {
        let key = entry.oid().to_bytes();
        let value = entry.flatten()?;

        let what = format!("update {} {}", self.type_name, entry.oid());
        retrying_update(self.disk.as_ref(), &self.policy, &what, |txn| {
            txn.put(&self.primary, &key, &value)
        })
        .map_err(|e| e.context(what.clone()))
    }

    fn delete(&self, entry: &PersistentEntry) -> Result<()> {
        let schema = self.schema()?;
        let oid = entry.oid();
        let fields = entry.entry()?;
        let key = oid.to_bytes();

        let what = format!("delete {} {}", self.type_name, oid);
        let existed = retrying_update(self.disk.as_ref(), &self.policy, &what, |txn| {
            txn.delete(&self.primary, &key)
        })
        .map_err(|e| e.context(what.clone()))?;
        if !existed {
            debug!("{}: {} was not on disk", self.type_name, oid);
        }

        for index in schema.indexes.iter().rev() {
            index.unindex(oid, fields)?;
        }
        Ok(())
    }
}

fn oid_limit_key(zone: u32) -> Vec<u8> {
    format!("oid.{zone}").into_bytes()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::codec(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::codec(format!("decode {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{MemoryDisk, RedbDisk};
    use crate::locator::collect;
    use tempfile::tempdir;
    use tuplespace_common::FOREVER;

    fn fields() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn storage_on(disk: Arc<dyn Disk>) -> Storage {
        let storage = Storage::new(
            TypeName::from("Foo"),
            disk,
            &StorageConfig {
                scan_page_size: 4,
                ..StorageConfig::default()
            },
            Arc::new(DirtyBuffer::new()),
        );
        storage.init(false).unwrap();
        storage.set_fields(&fields()).unwrap();
        storage
    }

    fn foo(id: u64, a: i64, b: &str) -> PersistentEntry {
        PersistentEntry::new(
            Oid::new(0, id),
            MangledEntry::new("Foo").with("a", a).with("b", b),
            FOREVER,
        )
    }

    fn template(a: Option<i64>, b: Option<&str>) -> MangledEntry {
        let t = MangledEntry::new("Foo");
        let t = match a {
            Some(a) => t.with("a", a),
            None => t.with_null("a"),
        };
        match b {
            Some(b) => t.with("b", b),
            None => t.with_null("b"),
        }
    }

    #[test]
    fn test_init_unknown_type() {
        let storage = Storage::new(
            TypeName::from("Nope"),
            Arc::new(MemoryDisk::new()),
            &StorageConfig::default(),
            Arc::new(DirtyBuffer::new()),
        );
        assert!(matches!(storage.init(true), Err(Error::UnknownType(_))));
        assert!(!storage.init(false).unwrap());
    }

    #[test]
    fn test_schema_is_fixed() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let storage = storage_on(Arc::clone(&disk));
        storage.set_fields(&fields()).unwrap();

        let err = storage.set_fields(&["a".to_string()]).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { stored: 2, given: 1, .. }));

        let reopened = Storage::new(
            TypeName::from("Foo"),
            disk,
            &StorageConfig::default(),
            Arc::new(DirtyBuffer::new()),
        );
        assert!(reopened.init(true).unwrap());
        assert_eq!(reopened.fields(), Some(fields()));
        assert_eq!(reopened.index_tables(), vec!["Foo.idx.0", "Foo.idx.1"]);
    }

    #[test]
    fn test_write_load_delete() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        let e = foo(1, 1, "x");
        storage.write(&e).unwrap();

        let loaded = storage.load(Oid::new(0, 1)).unwrap().unwrap();
        assert_eq!(loaded.flatten().unwrap(), e.flatten().unwrap());
        assert_eq!(storage.num_entries().unwrap(), 1);

        storage.delete(&e).unwrap();
        assert!(storage.load(Oid::new(0, 1)).unwrap().is_none());
        assert_eq!(storage.num_entries().unwrap(), 0);
    }

    #[test]
    fn test_planner_prefers_fewest_hits() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        // a=7 on five entries, b="rare" on two of them
        for id in 0..5 {
            let b = if id < 2 { "rare" } else { "common" };
            storage.write(&foo(id, 7, b)).unwrap();
        }

        let plan = storage.plan(&template(Some(7), Some("rare"))).unwrap();
        assert!(matches!(plan, SearchPlan::Candidates { index: 1, count: 2, .. }));

        let mut found = storage.find(&template(Some(7), Some("rare"))).unwrap().unwrap();
        assert_eq!(
            collect(found.as_mut()).unwrap(),
            vec![Oid::new(0, 0), Oid::new(0, 1)]
        );
    }

    #[test]
    fn test_planner_ties_pick_first_field() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        storage.write(&foo(1, 1, "x")).unwrap();
        let plan = storage.plan(&template(Some(1), Some("x"))).unwrap();
        assert!(matches!(plan, SearchPlan::Candidates { index: 0, count: 1, .. }));
    }

    #[test]
    fn test_zero_hit_lookup_short_circuits() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        storage.write(&foo(1, 1, "x")).unwrap();

        let before = storage.index_lookups();
        let plan = storage.plan(&template(Some(99), Some("x"))).unwrap();
        assert_eq!(plan, SearchPlan::NoMatchPossible);
        assert_eq!(storage.index_lookups() - before, 1);
        assert!(storage.find(&template(Some(99), Some("x"))).unwrap().is_none());
    }

    #[test]
    fn test_values_past_schema_match_nothing() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        storage.write(&foo(1, 1, "x")).unwrap();

        let long = template(None, None).with("c", 5i64);
        assert_eq!(storage.plan(&long).unwrap(), SearchPlan::NoMatchPossible);
        assert!(storage.find(&long).unwrap().is_none());

        let null_tail = template(None, None).with_null("c");
        assert_eq!(storage.plan(&null_tail).unwrap(), SearchPlan::Wildcard);
    }

    #[test]
    fn test_wildcard_scans_everything() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        for id in 0..10 {
            storage.write(&foo(id, id as i64, "x")).unwrap();
        }
        assert_eq!(storage.plan(&template(None, None)).unwrap(), SearchPlan::Wildcard);
        let mut all = storage.find(&template(None, None)).unwrap().unwrap();
        assert_eq!(collect(all.as_mut()).unwrap().len(), 10);
    }

    #[test]
    fn test_delete_leaves_indexes_clean() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let storage = storage_on(Arc::clone(&disk));
        let e = foo(1, 1, "x");
        storage.write(&e).unwrap();
        storage.write(&foo(2, 1, "y")).unwrap();
        storage.delete(&e).unwrap();

        let oid = Oid::new(0, 1).to_bytes().to_vec();
        let txn = disk.begin(TxnMode::ReadOnly).unwrap();
        for (i, table) in storage.index_tables().iter().enumerate() {
            let hash = e.hash_code_for_field(i).unwrap();
            let values = txn.scan_dup(table, &hash.to_be_bytes(), None, 100).unwrap();
            assert!(!values.contains(&oid), "{table} still references {oid:?}");
        }
    }

    #[test]
    fn test_write_survives_contention() {
        let disk = Arc::new(MemoryDisk::new());
        let storage = storage_on(disk.clone());
        disk.inject_contention(3);
        storage.write(&foo(1, 1, "x")).unwrap();
        assert_eq!(disk.pending_contention(), 0);
        assert!(storage.load(Oid::new(0, 1)).unwrap().is_some());
    }

    #[test]
    fn test_find_cached_uses_dirty_buffer() {
        let dirty = Arc::new(DirtyBuffer::new());
        let storage = Storage::new(
            TypeName::from("Foo"),
            Arc::new(MemoryDisk::new()),
            &StorageConfig::default(),
            Arc::clone(&dirty),
        );
        dirty.push(crate::dirty::FlushKind::Write, foo(4, 1, "x"));

        let mut found = storage.find_cached(&template(Some(1), None)).unwrap();
        assert_eq!(collect(found.as_mut()).unwrap(), vec![Oid::new(0, 4)]);
        assert!(storage.find_cached(&template(Some(2), None)).is_none());
    }

    #[test]
    fn test_subtypes_and_oid_limits_persist() {
        let disk: Arc<dyn Disk> = Arc::new(MemoryDisk::new());
        let storage = storage_on(Arc::clone(&disk));
        assert!(storage.add_subtype(&TypeName::from("Bar")).unwrap());
        assert!(!storage.add_subtype(&TypeName::from("Bar")).unwrap());
        storage.set_oid_limit(2, 4096).unwrap();

        let reopened = Storage::new(
            TypeName::from("Foo"),
            disk,
            &StorageConfig::default(),
            Arc::new(DirtyBuffer::new()),
        );
        reopened.init(true).unwrap();
        assert_eq!(reopened.subtypes(), vec![TypeName::from("Bar")]);
        assert_eq!(reopened.oid_limit(2).unwrap(), 4096);
        assert_eq!(reopened.oid_limit(0).unwrap(), 0);
    }

    #[test]
    fn test_for_each_entry_pages() {
        let storage = storage_on(Arc::new(MemoryDisk::new()));
        for id in 0..9 {
            storage.write(&foo(id, 1, "x")).unwrap();
        }
        let mut seen = Vec::new();
        storage
            .for_each_entry(|e| {
                seen.push(e.oid());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_redb_backed_storage() {
        let dir = tempdir().unwrap();
        let disk: Arc<dyn Disk> = Arc::new(RedbDisk::open(dir.path().join("space.redb")).unwrap());
        let storage = storage_on(disk);

        for id in 0..6 {
            storage.write(&foo(id, id as i64 % 2, "x")).unwrap();
        }
        let mut odd = storage.find(&template(Some(1), None)).unwrap().unwrap();
        assert_eq!(collect(odd.as_mut()).unwrap().len(), 3);

        storage.delete(&foo(1, 1, "x")).unwrap();
        let mut odd = storage.find(&template(Some(1), None)).unwrap().unwrap();
        assert_eq!(collect(odd.as_mut()).unwrap().len(), 2);
    }
}
