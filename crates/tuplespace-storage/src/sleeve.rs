//! Cache-resident entry wrapper

use crate::codec::PersistentEntry;
use std::fmt;
use tuplespace_common::Oid;

/// Sleeve state flags
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SleeveState(u8);

impl SleeveState {
    /// Written but not yet persisted by the write scheduler
    pub const NOT_ON_DISK: u8 = 1;
    /// Taken, cancelled, expired or aborted
    pub const DELETED: u8 = 2;
    /// A write transaction is outstanding, the sleeve must not be flushed
    pub const PINNED: u8 = 4;

    #[must_use]
    pub const fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for SleeveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::NOT_ON_DISK) {
            names.push("NOT_ON_DISK");
        }
        if self.contains(Self::DELETED) {
            names.push("DELETED");
        }
        if self.contains(Self::PINNED) {
            names.push("PINNED");
        }
        write!(f, "SleeveState({})", names.join("|"))
    }
}

/// An entry plus its cache state
#[derive(Debug, Clone)]
pub struct EntrySleeve {
    entry: PersistentEntry,
    state: SleeveState,
}

impl EntrySleeve {
    /// Sleeve for a new write, not yet on disk
    pub fn written(entry: PersistentEntry) -> Self {
        let mut state = SleeveState::default();
        state.set(SleeveState::NOT_ON_DISK);
        Self { entry, state }
    }

    /// Sleeve for an entry read back from disk
    pub fn loaded(entry: PersistentEntry) -> Self {
        Self {
            entry,
            state: SleeveState::default(),
        }
    }

    pub fn oid(&self) -> Oid {
        self.entry.oid()
    }

    pub fn entry(&self) -> &PersistentEntry {
        &self.entry
    }

    pub fn entry_mut(&mut self) -> &mut PersistentEntry {
        &mut self.entry
    }

    pub fn state(&self) -> SleeveState {
        self.state
    }

    pub fn is_deleted(&self) -> bool {
        self.state.contains(SleeveState::DELETED)
    }

    pub fn set_deleted(&mut self) {
        self.state.set(SleeveState::DELETED);
    }

    pub fn is_pinned(&self) -> bool {
        self.state.contains(SleeveState::PINNED)
    }

    pub fn pin(&mut self) {
        self.state.set(SleeveState::PINNED);
    }

    pub fn unpin(&mut self) {
        self.state.clear(SleeveState::PINNED);
    }

    pub fn is_on_disk(&self) -> bool {
        !self.state.contains(SleeveState::NOT_ON_DISK)
    }

    pub fn set_on_disk(&mut self) {
        self.state.clear(SleeveState::NOT_ON_DISK);
    }

    pub fn has_expired(&self, now: u64) -> bool {
        self.entry.has_expired(now)
    }

    /// Neither deleted nor expired at `now`
    pub fn is_live(&self, now: u64) -> bool {
        !self.is_deleted() && !self.has_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MangledEntry;

    fn entry() -> PersistentEntry {
        PersistentEntry::new(Oid::new(0, 1), MangledEntry::new("Foo").with("a", 1i64), 100)
    }

    #[test]
    fn test_written_sleeve_is_not_on_disk() {
        let mut sleeve = EntrySleeve::written(entry());
        assert!(!sleeve.is_on_disk());
        sleeve.set_on_disk();
        assert!(sleeve.is_on_disk());
        assert!(EntrySleeve::loaded(entry()).is_on_disk());
    }

    #[test]
    fn test_flags_are_independent() {
        let mut sleeve = EntrySleeve::written(entry());
        sleeve.pin();
        sleeve.set_deleted();
        sleeve.unpin();
        assert!(sleeve.is_deleted());
        assert!(!sleeve.is_pinned());
        assert!(!sleeve.is_on_disk());
        assert_eq!(
            format!("{:?}", sleeve.state()),
            "SleeveState(NOT_ON_DISK|DELETED)"
        );
    }

    #[test]
    fn test_liveness() {
        let mut sleeve = EntrySleeve::loaded(entry());
        assert!(sleeve.is_live(100));
        assert!(!sleeve.is_live(101));
        sleeve.set_deleted();
        assert!(!sleeve.is_live(0));
    }
}
