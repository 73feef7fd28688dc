//! Repository context
//!
//! Owns the disk provider, the op log and one [`EntryRepository`] per entry
//! type. Known types are recorded in a registry table so they are opened
//! again on restart. A background thread reaps expired leases.

use crate::codec::MangledEntry;
use crate::disk::{retrying_update, Disk, MemoryDisk, RedbDisk, RetryPolicy, TxnMode};
use crate::lease::{ExpiryTracker, LeaseTracker, NullTracker, ReapFilter, Reaper};
use crate::oplog::{LogRecord, OpLog};
use crate::ops::{AutoCommit, SearchResponse, SearchVisitor, WriteEscort};
use crate::repository::EntryRepository;
use crate::sleeve_cache::{SleeveCache, SleeveCacheOptions};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use tuplespace_common::config::Backend;
use tuplespace_common::{now_millis, Config, Error, Oid, Result, TypeName};

/// Registry of known entry types
const TYPES_TABLE: &str = "space.types";

type Repositories = Arc<RwLock<HashMap<TypeName, Arc<EntryRepository>>>>;

pub struct RepositoryContext {
    config: Config,
    disk: Arc<dyn Disk>,
    oplog: Option<Arc<OpLog>>,
    reaper: Arc<Reaper>,
    repos: Repositories,
    policy: RetryPolicy,
    create_lock: Mutex<()>,
    closed: AtomicBool,
    stop: Mutex<Option<Sender<()>>>,
    reaper_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RepositoryContext {
    /// Open the configured backend under `storage.data_dir`, reopen every
    /// known type and replay the op log
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let disk: Arc<dyn Disk> = match config.storage.backend {
            Backend::Memory => Arc::new(MemoryDisk::new()),
            Backend::Redb => {
                std::fs::create_dir_all(&config.storage.data_dir)?;
                Arc::new(RedbDisk::open(config.storage.data_dir.join("space.redb"))?)
            }
        };
        Self::with_disk(config, disk)
    }

    /// Open on an existing disk provider
    pub fn with_disk(config: Config, disk: Arc<dyn Disk>) -> Result<Self> {
        let oplog = if config.log.enabled {
            let path = if config.log.path.is_absolute() {
                config.log.path.clone()
            } else {
                config.storage.data_dir.join(&config.log.path)
            };
            Some(Arc::new(OpLog::open(path, config.log.sync_on_write)?))
        } else {
            None
        };

        let ctx = Self {
            policy: RetryPolicy::from(&config.storage),
            config,
            disk,
            oplog,
            reaper: Arc::new(Reaper::new()),
            repos: Arc::new(RwLock::new(HashMap::new())),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            stop: Mutex::new(None),
            reaper_handle: Mutex::new(None),
        };

        for type_name in ctx.known_types()? {
            ctx.open_repository(&type_name)?;
        }
        let replayed = ctx.recover()?;
        if replayed > 0 {
            ctx.checkpoint()?;
        }

        if ctx.config.lease.reaping_enabled {
            ctx.start_reaper()?;
        }

        info!(
            "Opened {} repository context with {} types on {}",
            if ctx.oplog.is_some() { "logged" } else { "unlogged" },
            ctx.repos.read().len(),
            ctx.disk.name()
        );
        Ok(ctx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn disk(&self) -> &Arc<dyn Disk> {
        &self.disk
    }

    pub fn oplog(&self) -> Option<&Arc<OpLog>> {
        self.oplog.as_ref()
    }

    /// Escort for writes outside a transaction
    pub fn auto_commit(&self) -> AutoCommit {
        AutoCommit::new(self.oplog.clone())
    }

    fn known_types(&self) -> Result<Vec<TypeName>> {
        let page_size = self.config.storage.scan_page_size;
        let mut types = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let txn = self.disk.begin(TxnMode::ReadOnly)?;
            let page = txn.scan(TYPES_TABLE, after.as_deref(), page_size)?;
            txn.abort()?;

            let done = page.len() < page_size;
            for (key, _) in page {
                let name = String::from_utf8(key.clone())
                    .map_err(|e| Error::codec(format!("type registry key: {e}")))?;
                types.push(TypeName::from(name));
                after = Some(key);
            }
            if done {
                return Ok(types);
            }
        }
    }

    fn open_repository(&self, type_name: &TypeName) -> Result<Arc<EntryRepository>> {
        let tracker: Arc<dyn LeaseTracker> = if self.config.lease.reaping_enabled {
            Arc::new(ExpiryTracker::new())
        } else {
            Arc::new(NullTracker)
        };
        let cache = SleeveCache::open(
            type_name.clone(),
            Arc::clone(&self.disk),
            &self.config,
            SleeveCacheOptions {
                tracker,
                reaper: Arc::clone(&self.reaper),
                oplog: self.oplog.clone(),
                must_exist: false,
            },
        )?;
        let repo = Arc::new(EntryRepository::new(cache));
        self.repos
            .write()
            .insert(type_name.clone(), Arc::clone(&repo));
        Ok(repo)
    }

    /// Repository of an already known type
    pub fn repository(&self, type_name: &TypeName) -> Option<Arc<EntryRepository>> {
        self.repos.read().get(type_name).cloned()
    }

    /// Repository of `type_name`, registering the type if it is new
    pub fn get_or_create(&self, type_name: &TypeName) -> Result<Arc<EntryRepository>> {
        self.get_or_create_inner(type_name).map(|(repo, _)| repo)
    }

    fn get_or_create_inner(&self, type_name: &TypeName) -> Result<(Arc<EntryRepository>, bool)> {
        if let Some(repo) = self.repository(type_name) {
            return Ok((repo, false));
        }
        let _guard = self.create_lock.lock();
        if let Some(repo) = self.repository(type_name) {
            return Ok((repo, false));
        }

        let key = type_name.as_str().as_bytes().to_vec();
        retrying_update(self.disk.as_ref(), &self.policy, "register type", |txn| {
            txn.put(TYPES_TABLE, &key, &[])
        })
        .map_err(|e| e.context(format!("register type {type_name}")))?;

        info!("Registered entry type {}", type_name);
        Ok((self.open_repository(type_name)?, true))
    }

    /// Names of every known type
    pub fn types(&self) -> Vec<TypeName> {
        let mut types: Vec<_> = self.repos.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Write `entry` into its type's repository, registering the type and
    /// its supertype chain on first use
    pub fn write(
        &self,
        entry: MangledEntry,
        lease_ms: u64,
        escort: &dyn WriteEscort,
    ) -> Result<Option<Oid>> {
        let type_name = entry.type_name().clone();
        let (repo, created) = self.get_or_create_inner(&type_name)?;
        if created {
            let mut child = type_name;
            for parent in entry.supertypes() {
                self.get_or_create(parent)?.storage().add_subtype(&child)?;
                child = parent.clone();
            }
        }
        repo.write(entry, lease_ms, escort)
    }

    /// Search the template's type and all of its known subtypes
    pub fn find(
        &self,
        template: &MangledEntry,
        visitor: &mut dyn SearchVisitor,
    ) -> Result<SearchResponse> {
        let mut queue = VecDeque::from([template.type_name().clone()]);
        let mut visited = HashSet::new();

        while let Some(type_name) = queue.pop_front() {
            if !visited.insert(type_name.clone()) {
                continue;
            }
            let Some(repo) = self.repository(&type_name) else {
                continue;
            };
            let response = repo.find(template, visitor)?;
            if response.is_terminal() {
                return Ok(response);
            }
            queue.extend(repo.storage().subtypes());
        }
        Ok(SearchResponse::TryAgain)
    }

    /// Replay the op log. Returns the number of operations applied.
    pub fn recover(&self) -> Result<usize> {
        let Some(log) = &self.oplog else {
            return Ok(0);
        };

        let mut applied = 0;
        let last = log.replay(1, |lsn, record| {
            if let LogRecord::InstanceCount { type_name, count } = &record {
                let current = self.repository(type_name).map(|r| r.counters().instances);
                debug!(
                    "LSN {}: {} had {} instances at first use (now {:?})",
                    lsn, type_name, count, current
                );
                return Ok(());
            }

            let repo = match &record {
                LogRecord::Write { type_name, .. } => self.get_or_create(type_name)?,
                other => match self.repository(other.type_name()) {
                    Some(repo) => repo,
                    None => {
                        warn!("LSN {}: no repository for {}", lsn, other.type_name());
                        return Ok(());
                    }
                },
            };
            if let Some(op) = record.into_op()? {
                op.restore(&repo)?;
                applied += 1;
            }
            Ok(())
        })?;

        if applied > 0 {
            info!("Replayed {} operations up to LSN {}", applied, last);
        }
        Ok(applied)
    }

    /// Flush every repository and drop the log records now on disk
    pub fn checkpoint(&self) -> Result<()> {
        let lsn = self.oplog.as_ref().map(|log| log.current_lsn());
        self.sync()?;
        if let (Some(log), Some(lsn)) = (&self.oplog, lsn) {
            log.truncate_before(lsn + 1)?;
            info!("Checkpoint at LSN {}", lsn);
        }
        Ok(())
    }

    /// Flush every repository's pending work
    pub fn sync(&self) -> Result<()> {
        let repos: Vec<_> = self.repos.read().values().cloned().collect();
        for repo in repos {
            repo.sync()?;
        }
        if let Some(log) = &self.oplog {
            log.sync()?;
        }
        Ok(())
    }

    /// Reap expired leases in every repository
    pub fn reap(&self) -> usize {
        reap_all(&self.repos)
    }

    pub fn add_reap_filter(&self, filter: Arc<dyn ReapFilter>) {
        self.reaper.add_filter(filter);
    }

    fn start_reaper(&self) -> Result<()> {
        let repos = Arc::clone(&self.repos);
        let interval = self.config.lease.reap_interval();
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("lease-reaper".into())
            .spawn(move || {
                info!("Lease reaper started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            reap_all(&repos);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Lease reaper stopped");
            })?;

        *self.stop.lock() = Some(stop);
        *self.reaper_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the reaper, drain every repository and drop the log records
    /// that are now on disk
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let lsn = self.oplog.as_ref().map(|log| log.current_lsn());

        drop(self.stop.lock().take());
        if let Some(handle) = self.reaper_handle.lock().take() {
            if handle.join().is_err() {
                error!("Lease reaper panicked");
            }
        }

        let repos: Vec<_> = self.repos.read().values().cloned().collect();
        let mut first_error = None;
        for repo in repos {
            if let Err(e) = repo.shutdown() {
                error!("Shutdown of {} failed: {}", repo.type_name(), e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            // Unwritten work stays in the log for the next open
            if let Some(log) = &self.oplog
                && let Err(le) = log.sync()
            {
                error!("Oplog sync on failed shutdown: {}", le);
            }
            return Err(e);
        }

        if let (Some(log), Some(lsn)) = (&self.oplog, lsn) {
            log.sync()?;
            log.truncate_before(lsn + 1)?;
        }
        info!("Repository context closed");
        Ok(())
    }
}

fn reap_all(repos: &Repositories) -> usize {
    let now = now_millis();
    let repos: Vec<_> = repos.read().values().cloned().collect();
    let reaped: usize = repos.iter().map(|repo| repo.reap(now)).sum();
    if reaped > 0 {
        debug!("Reaped {} expired entries", reaped);
    }
    reaped
}

impl Drop for RepositoryContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Repository context shutdown failed: {}", e);
        }
    }
}
