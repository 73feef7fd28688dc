//! Asynchronous write scheduler
//!
//! Dirty sleeves become visible as soon as they are in the cache; their
//! disk image is produced later by a small pool of flusher threads that call
//! back into an [`EntryEditor`]. Work is keyed by OID in a shared
//! [`DirtyBuffer`], so readers can consult it before disk.
//!
//! Work that keeps failing is parked in the buffer instead of discarded.
//! [`WriteScheduler::sync`] retries parked work and fails while any remains.

use crate::codec::PersistentEntry;
use crate::dirty::{Completion, DirtyBuffer, DirtyView, Failure, FlushKind, PushOutcome};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tuplespace_common::config::WriterConfig;
use tuplespace_common::{Error, Oid, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The only disk-mutating entry points, implemented by storage
pub trait EntryEditor: Send + Sync {
    fn write(&self, entry: &PersistentEntry) -> Result<()>;
    fn update(&self, entry: &PersistentEntry) -> Result<()>;
    fn delete(&self, entry: &PersistentEntry) -> Result<()>;
}

/// Told when the latest state of an OID has reached disk
pub trait FlushObserver: Send + Sync {
    fn flushed(&self, oid: Oid, kind: FlushKind);
}

/// Outcome of running one OID's pending work
enum Step {
    Idle,
    Done,
    Requeue,
    Retry(Error),
    GaveUp(Error),
}

impl Step {
    fn into_error(self) -> Option<Error> {
        match self {
            Self::Retry(e) | Self::GaveUp(e) => Some(e),
            Self::Idle | Self::Done | Self::Requeue => None,
        }
    }
}

struct Shared {
    name: String,
    buffer: Arc<DirtyBuffer>,
    editor: Arc<dyn EntryEditor>,
    observer: OnceLock<Weak<dyn FlushObserver>>,
    config: WriterConfig,
    sender: Sender<Oid>,
    shutdown: AtomicBool,
    flushed: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn run(&self, oid: Oid) -> Step {
        let Some((op, generation)) = self.buffer.claim(oid) else {
            return Step::Idle;
        };

        let result = match op.kind {
            FlushKind::Write => self.editor.write(&op.entry),
            FlushKind::Update => self.editor.update(&op.entry),
            FlushKind::Delete => self.editor.delete(&op.entry),
        };

        match result {
            Ok(()) => {
                // Observers hear about the disk image before the slot goes,
                // so a drained buffer means every observer has been told
                if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
                    observer.flushed(oid, op.kind);
                }
                match self.buffer.complete(oid, generation) {
                    Completion::Done(kind) => {
                        self.flushed.fetch_add(1, Ordering::Relaxed);
                        debug!("{}: flushed {:?} of {}", self.name, kind, oid);
                        Step::Done
                    }
                    Completion::Requeue => Step::Requeue,
                }
            }
            Err(e) => match self.buffer.fail(oid, self.config.max_flush_attempts) {
                Failure::Retry(attempt) => {
                    warn!(
                        "{}: {:?} of {} failed (attempt {}): {}",
                        self.name, op.kind, oid, attempt, e
                    );
                    Step::Retry(e)
                }
                Failure::GaveUp(attempts) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "{}: parking {:?} of {} after {} attempts: {}",
                        self.name, op.kind, oid, attempts, e
                    );
                    Step::GaveUp(e)
                }
            },
        }
    }

    fn worker(&self, rx: &Receiver<Oid>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let oid = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(oid) => oid,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match self.run(oid) {
                Step::Idle | Step::Done | Step::GaveUp(_) => {}
                Step::Requeue => self.requeue(oid),
                Step::Retry(_) => {
                    thread::sleep(self.config.retry_delay());
                    self.requeue(oid);
                }
            }
        }
    }

    fn requeue(&self, oid: Oid) {
        if self.sender.send(oid).is_err() {
            warn!("{}: flusher queue closed, {} left for sync", self.name, oid);
        }
    }
}

/// Write-behind scheduler for one entry type
pub struct WriteScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WriteScheduler {
    /// Start `config.threads` flushers writing through `editor`
    pub fn start(
        name: impl Into<String>,
        buffer: Arc<DirtyBuffer>,
        editor: Arc<dyn EntryEditor>,
        config: WriterConfig,
    ) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let threads = config.threads.max(1);

        let shared = Arc::new(Shared {
            name: name.clone(),
            buffer,
            editor,
            observer: OnceLock::new(),
            config,
            sender,
            shutdown: AtomicBool::new(false),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-flush-{i}"))
                .spawn(move || shared.worker(&rx))?;
            workers.push(handle);
        }

        info!("Started write scheduler {} with {} flushers", name, threads);
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Register the observer told about completed flushes
    pub fn set_observer(&self, observer: Weak<dyn FlushObserver>) {
        if self.shared.observer.set(observer).is_err() {
            warn!("{}: flush observer already set", self.shared.name);
        }
    }

    /// Schedule a disk operation for `entry`
    pub fn add(&self, kind: FlushKind, entry: PersistentEntry) -> PushOutcome {
        let oid = entry.oid();
        let outcome = self.shared.buffer.push(kind, entry);
        if outcome == PushOutcome::Queued {
            if self.shared.shutdown.load(Ordering::Relaxed) {
                // No flushers left, apply on the caller's thread
                if let Err(e) = self.force(oid) {
                    error!("{}: inline flush of {} failed: {}", self.shared.name, oid, e);
                }
            } else {
                self.shared.requeue(oid);
            }
        }
        outcome
    }

    /// Pending state of `oid` not yet on disk
    pub fn dirty_read(&self, oid: Oid) -> Option<DirtyView> {
        self.shared.buffer.dirty_read(oid)
    }

    /// Apply any pending work for `oid` on the calling thread
    pub fn force(&self, oid: Oid) -> Result<()> {
        loop {
            self.shared.buffer.wait_settled(oid);
            match self.shared.run(oid) {
                Step::Idle if !self.shared.buffer.contains(oid) => return Ok(()),
                Step::Done => return Ok(()),
                Step::Idle | Step::Requeue => {}
                Step::Retry(e) | Step::GaveUp(e) => return Err(e),
            }
        }
    }

    /// Drain all pending work, helping the flushers on the calling thread.
    ///
    /// Parked work gets one more attempt first. Returns the first failure
    /// seen, and fails while anything is still parked afterwards.
    pub fn sync(&self) -> Result<()> {
        let buffer = &self.shared.buffer;
        let mut first_error = None;
        for oid in buffer.parked() {
            if let Some(e) = self.shared.run(oid).into_error() {
                first_error.get_or_insert(e);
            }
        }
        loop {
            let ready = buffer.ready();
            if ready.is_empty() {
                if !buffer.has_work() {
                    break;
                }
                buffer.wait_progress(POLL_INTERVAL);
                continue;
            }
            for oid in ready {
                if let Some(e) = self.shared.run(oid).into_error() {
                    first_error.get_or_insert(e);
                }
            }
        }

        let parked = buffer.parked().len();
        match first_error {
            Some(e) => Err(e),
            None if parked > 0 => Err(Error::storage(format!(
                "{}: {} operations could not be written",
                self.shared.name, parked
            ))),
            None => Ok(()),
        }
    }

    /// Operations not yet on disk
    pub fn pending(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Operations completed so far
    pub fn flushed(&self) -> u64 {
        self.shared.flushed.load(Ordering::Relaxed)
    }

    /// Times an operation exhausted its attempts and was parked
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop the flushers and drain what is left
    pub fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return Ok(());
        }
        for handle in workers {
            // The last owner may be dropped on a flusher thread
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!("{}: flusher thread panicked", self.shared.name);
            }
        }
        info!("Stopped write scheduler {}", self.shared.name);
        self.sync()
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("{}: final flush failed: {}", self.shared.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MangledEntry;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    /// Editor recording the last operation per OID
    #[derive(Default)]
    struct Recorder {
        ops: Mutex<HashMap<Oid, FlushKind>>,
        writes: AtomicU32,
        fail_next: AtomicU32,
    }

    impl Recorder {
        fn record(&self, entry: &PersistentEntry, kind: FlushKind) -> Result<()> {
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::storage("injected"));
            }
            if kind == FlushKind::Write {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            self.ops.lock().insert(entry.oid(), kind);
            Ok(())
        }
    }

    impl EntryEditor for Recorder {
        fn write(&self, entry: &PersistentEntry) -> Result<()> {
            self.record(entry, FlushKind::Write)
        }
        fn update(&self, entry: &PersistentEntry) -> Result<()> {
            self.record(entry, FlushKind::Update)
        }
        fn delete(&self, entry: &PersistentEntry) -> Result<()> {
            self.record(entry, FlushKind::Delete)
        }
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<(Oid, FlushKind)>>);

    impl FlushObserver for Seen {
        fn flushed(&self, oid: Oid, kind: FlushKind) {
            self.0.lock().push((oid, kind));
        }
    }

    fn entry(id: u64) -> PersistentEntry {
        PersistentEntry::new(Oid::new(0, id), MangledEntry::new("Foo").with("a", 1i64), 10)
    }

    fn scheduler(editor: Arc<Recorder>, config: WriterConfig) -> WriteScheduler {
        WriteScheduler::start("test", Arc::new(DirtyBuffer::new()), editor, config).unwrap()
    }

    #[test]
    fn test_flush_reaches_editor_and_observer() {
        let editor = Arc::new(Recorder::default());
        let sched = scheduler(editor.clone(), WriterConfig::default());
        let seen = Arc::new(Seen::default());
        let weak: Weak<dyn FlushObserver> = Arc::downgrade(&seen) as Weak<dyn FlushObserver>;
        sched.set_observer(weak);

        for id in 0..20 {
            sched.add(FlushKind::Write, entry(id));
        }
        sched.sync().unwrap();

        assert_eq!(sched.pending(), 0);
        assert_eq!(editor.ops.lock().len(), 20);
        assert_eq!(seen.0.lock().len(), 20);
    }

    #[test]
    fn test_add_after_shutdown_is_inline() {
        let editor = Arc::new(Recorder::default());
        let sched = scheduler(editor.clone(), WriterConfig::default());
        sched.shutdown().unwrap();

        sched.add(FlushKind::Write, entry(1));
        assert!(sched.dirty_read(Oid::new(0, 1)).is_none());
        assert_eq!(editor.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_write_never_reaches_disk() {
        let editor = Arc::new(Recorder::default());
        let sched = scheduler(
            editor.clone(),
            WriterConfig {
                threads: 1,
                ..WriterConfig::default()
            },
        );
        let outcome = sched.add(FlushKind::Write, entry(7));
        assert_eq!(outcome, PushOutcome::Queued);
        sched.add(FlushKind::Delete, entry(7));
        sched.sync().unwrap();

        let last = editor.ops.lock().get(&Oid::new(0, 7)).copied();
        assert!(last.is_none() || last == Some(FlushKind::Delete));
    }

    #[test]
    fn test_failed_flush_is_retried() {
        let editor = Arc::new(Recorder::default());
        editor.fail_next.store(2, Ordering::SeqCst);
        let sched = scheduler(
            editor.clone(),
            WriterConfig {
                threads: 1,
                max_flush_attempts: 5,
                retry_delay_ms: 1,
            },
        );

        sched.add(FlushKind::Write, entry(1));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sched.pending() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sched.sync().ok();

        assert_eq!(editor.writes.load(Ordering::SeqCst), 1);
        assert_eq!(sched.dropped(), 0);
    }

    #[test]
    fn test_exhausted_flush_is_parked_until_sync() {
        let editor = Arc::new(Recorder::default());
        editor.fail_next.store(10, Ordering::SeqCst);
        let sched = scheduler(
            editor.clone(),
            WriterConfig {
                threads: 1,
                max_flush_attempts: 2,
                retry_delay_ms: 1,
            },
        );

        sched.add(FlushKind::Write, entry(1));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sched.dropped() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sched.dropped(), 1);

        // Still readable, still owed to disk
        assert!(matches!(
            sched.dirty_read(Oid::new(0, 1)),
            Some(DirtyView::Live(_))
        ));
        assert_eq!(sched.pending(), 1);
        assert!(sched.sync().is_err());
        assert_eq!(sched.pending(), 1);

        editor.fail_next.store(0, Ordering::SeqCst);
        sched.sync().unwrap();
        assert_eq!(sched.pending(), 0);
        assert_eq!(editor.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_applies_inline() {
        let editor = Arc::new(Recorder::default());
        let sched = scheduler(editor.clone(), WriterConfig::default());
        sched.add(FlushKind::Update, entry(3));
        sched.force(Oid::new(0, 3)).unwrap();
        assert!(sched.dirty_read(Oid::new(0, 3)).is_none());
        assert_eq!(
            editor.ops.lock().get(&Oid::new(0, 3)).copied(),
            Some(FlushKind::Update)
        );
    }
}
