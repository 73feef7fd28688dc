//! Core type definitions for the entry store
//!
//! This module defines the identifiers and time primitives shared by every
//! layer of the storage engine.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lease expiry meaning "never expires"
pub const FOREVER: u64 = u64::MAX;

/// Current wall-clock time in milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert a relative lease duration into an absolute expiry, saturating at
/// [`FOREVER`].
#[must_use]
pub fn expiry_after(now: u64, duration_ms: u64) -> u64 {
    now.saturating_add(duration_ms)
}

/// Name of an entry type (one storage table per type)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct TypeName(String);

impl TypeName {
    /// Create a type name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the type name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Debug for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeName({})", self.0)
    }
}

/// Primary key of a stored entry.
///
/// An OID is allocated once, never reused, and is monotonically increasing
/// within its zone. The byte form is big-endian `zone || id`, so byte order
/// and `Ord` agree and on-disk scans come back in allocation order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid {
    zone: u32,
    id: u64,
}

impl Oid {
    /// Encoded width in bytes
    pub const SIZE: usize = 12;

    /// Create an OID from its parts
    #[must_use]
    pub const fn new(zone: u32, id: u64) -> Self {
        Self { zone, id }
    }

    /// Allocation zone
    #[must_use]
    pub const fn zone(&self) -> u32 {
        self.zone
    }

    /// Sequence number within the zone
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Fixed-width big-endian encoding
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.zone.to_be_bytes());
        buf[4..12].copy_from_slice(&self.id.to_be_bytes());
        buf
    }

    /// Decode from the fixed-width encoding
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            zone: u32::from_be_bytes(data[0..4].try_into().ok()?),
            id: u64::from_be_bytes(data[4..12].try_into().ok()?),
        })
    }

    /// Hash used to pick a cache partition
    #[must_use]
    pub fn partition_hash(&self) -> u32 {
        let mixed = self.id ^ (u64::from(self.zone) << 32) ^ (self.id >> 29);
        (mixed ^ (mixed >> 32)) as u32
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({}:{})", self.zone, self.id)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_bytes_roundtrip() {
        let oid = Oid::new(3, 0xDEAD_BEEF);
        let bytes = oid.to_bytes();
        assert_eq!(Oid::from_bytes(&bytes), Some(oid));
        assert_eq!(Oid::from_bytes(&bytes[..11]), None);
    }

    #[test]
    fn test_oid_byte_order_matches_ord() {
        let a = Oid::new(0, 255);
        let b = Oid::new(0, 256);
        let c = Oid::new(1, 0);

        assert!(a < b && b < c);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
    }

    #[test]
    fn test_expiry_saturates() {
        assert_eq!(expiry_after(10, 5), 15);
        assert_eq!(expiry_after(10, FOREVER), FOREVER);
    }

    #[test]
    fn test_type_name_display() {
        let name = TypeName::from("Foo");
        assert_eq!(name.to_string(), "Foo");
        assert_eq!(name.as_str(), "Foo");
    }
}
