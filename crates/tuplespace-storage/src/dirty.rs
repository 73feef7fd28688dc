//! Write-behind buffer
//!
//! Holds at most one pending disk operation per OID. A newer operation for
//! the same OID coalesces with the pending one:
//!
//! | pending | incoming | result              |
//! |---------|----------|---------------------|
//! | Write   | Write    | Write (new entry)   |
//! | Write   | Update   | Write (new entry)   |
//! | Write   | Delete   | both dropped        |
//! | Update  | Update   | Update (new entry)  |
//! | Update  | Delete   | Delete              |
//! | Delete  | any      | Delete              |
//!
//! While an operation is in flight its slot stays claimed; anything arriving
//! meanwhile is queued behind it and never dispatched concurrently.
//!
//! A slot that exhausts its flush attempts is parked rather than dropped. It
//! keeps serving reads and searches, is skipped by [`DirtyBuffer::ready`], and
//! goes back to the queue on the next push or an explicit retry.

use crate::codec::{MangledEntry, PersistentEntry};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Duration;
use tuplespace_common::Oid;

/// Disk operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    Write,
    Update,
    Delete,
}

/// One pending disk operation
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub kind: FlushKind,
    pub entry: PersistentEntry,
}

/// What [`DirtyBuffer::push`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New work: the OID must be handed to a flusher
    Queued,
    /// Merged into work already queued or in flight
    Coalesced,
    /// A never-flushed write was deleted, nothing reaches disk
    Cancelled,
}

/// What a reader sees for an OID with pending work
#[derive(Debug, Clone)]
pub enum DirtyView {
    Live(PersistentEntry),
    Deleted,
}

/// Result of finishing an in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The slot is gone, the latest state of the OID is on disk
    Done(FlushKind),
    /// Newer work arrived while in flight, dispatch again
    Requeue,
}

/// Result of a failed in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Retry(u32),
    GaveUp(u32),
}

#[derive(Debug)]
struct Slot {
    op: PendingOp,
    generation: u64,
    in_flight: bool,
    queued: bool,
    parked: bool,
    attempts: u32,
}

#[derive(Default)]
pub struct DirtyBuffer {
    slots: Mutex<HashMap<Oid, Slot>>,
    changed: Condvar,
}

impl DirtyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending operation for `entry`
    pub fn push(&self, kind: FlushKind, entry: PersistentEntry) -> PushOutcome {
        let oid = entry.oid();
        let mut slots = self.slots.lock();

        let Some(slot) = slots.get_mut(&oid) else {
            slots.insert(
                oid,
                Slot {
                    op: PendingOp { kind, entry },
                    generation: 0,
                    in_flight: false,
                    queued: true,
                    parked: false,
                    attempts: 0,
                },
            );
            return PushOutcome::Queued;
        };

        let merged = if slot.in_flight {
            // The in-flight op lands first, so a rewrite becomes an update
            match (slot.op.kind, kind) {
                (FlushKind::Delete, _) => FlushKind::Delete,
                (_, FlushKind::Write) => FlushKind::Update,
                (_, k) => k,
            }
        } else {
            match (slot.op.kind, kind) {
                (FlushKind::Write, FlushKind::Delete) => {
                    slots.remove(&oid);
                    self.changed.notify_all();
                    return PushOutcome::Cancelled;
                }
                (FlushKind::Delete, _) => FlushKind::Delete,
                (FlushKind::Write, _) => FlushKind::Write,
                (FlushKind::Update, k) => k,
            }
        };

        if slot.op.kind != FlushKind::Delete {
            slot.op.entry = entry;
        }
        slot.op.kind = merged;
        slot.generation += 1;

        if slot.in_flight || slot.queued {
            PushOutcome::Coalesced
        } else {
            slot.queued = true;
            slot.parked = false;
            slot.attempts = 0;
            PushOutcome::Queued
        }
    }

    /// Take the pending operation for dispatch. `None` if there is nothing to
    /// do or the OID is already in flight.
    pub fn claim(&self, oid: Oid) -> Option<(PendingOp, u64)> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&oid)?;
        if slot.in_flight {
            return None;
        }
        slot.in_flight = true;
        slot.queued = false;
        slot.parked = false;
        Some((slot.op.clone(), slot.generation))
    }

    /// Finish a successful dispatch of `generation`
    pub fn complete(&self, oid: Oid, generation: u64) -> Completion {
        let mut slots = self.slots.lock();
        let completion = match slots.get_mut(&oid) {
            Some(slot) if slot.generation == generation => {
                let kind = slot.op.kind;
                slots.remove(&oid);
                Completion::Done(kind)
            }
            Some(slot) => {
                slot.in_flight = false;
                slot.attempts = 0;
                slot.queued = true;
                Completion::Requeue
            }
            None => Completion::Done(FlushKind::Update),
        };
        self.changed.notify_all();
        completion
    }

    /// Finish a failed dispatch, parking the slot after `max_attempts`
    pub fn fail(&self, oid: Oid, max_attempts: u32) -> Failure {
        let mut slots = self.slots.lock();
        let failure = match slots.get_mut(&oid) {
            Some(slot) => {
                slot.in_flight = false;
                slot.attempts += 1;
                if slot.attempts >= max_attempts {
                    slot.queued = false;
                    slot.parked = true;
                    Failure::GaveUp(slot.attempts)
                } else {
                    slot.queued = true;
                    Failure::Retry(slot.attempts)
                }
            }
            None => Failure::GaveUp(0),
        };
        self.changed.notify_all();
        failure
    }

    /// Pending state of `oid`, if any
    pub fn dirty_read(&self, oid: Oid) -> Option<DirtyView> {
        let slots = self.slots.lock();
        slots.get(&oid).map(|slot| match slot.op.kind {
            FlushKind::Delete => DirtyView::Deleted,
            FlushKind::Write | FlushKind::Update => DirtyView::Live(slot.op.entry.clone()),
        })
    }

    /// Live pending entries whose field hashes agree with the template's
    /// non-null fields
    pub fn matching(&self, template: &MangledEntry) -> Vec<Oid> {
        let wanted: Vec<(usize, u32)> = (0..template.field_count())
            .filter_map(|i| template.field_hash(i).map(|h| (i, h)))
            .collect();

        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|(_, slot)| slot.op.kind != FlushKind::Delete)
            .filter(|(_, slot)| {
                wanted
                    .iter()
                    .all(|&(i, h)| slot.op.entry.hash_code_for_field(i) == Some(h))
            })
            .map(|(oid, _)| *oid)
            .collect()
    }

    /// OIDs with work that is neither in flight nor parked
    pub fn ready(&self) -> Vec<Oid> {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|(_, slot)| !slot.in_flight && !slot.parked)
            .map(|(oid, _)| *oid)
            .collect()
    }

    /// OIDs whose flush gave up and that wait for a retry
    pub fn parked(&self) -> Vec<Oid> {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|(_, slot)| slot.parked)
            .map(|(oid, _)| *oid)
            .collect()
    }

    /// Whether any slot is queued or in flight
    pub fn has_work(&self) -> bool {
        self.slots.lock().values().any(|s| !s.parked)
    }

    /// Block while `oid` is in flight
    pub fn wait_settled(&self, oid: Oid) {
        let mut slots = self.slots.lock();
        while slots.get(&oid).is_some_and(|s| s.in_flight) {
            self.changed.wait(&mut slots);
        }
    }

    /// Block briefly while every remaining slot is in flight or parked, with
    /// at least one in flight
    pub fn wait_progress(&self, timeout: Duration) {
        let mut slots = self.slots.lock();
        if slots.values().any(|s| s.in_flight)
            && slots.values().all(|s| s.in_flight || s.parked)
        {
            self.changed.wait_for(&mut slots, timeout);
        }
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.slots.lock().contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
