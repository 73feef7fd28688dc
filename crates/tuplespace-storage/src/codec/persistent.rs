//! On-disk form of one entry
//!
//! ```text
//! +--------+------+-----------+-----------------+-------------+
//! | Expiry | OID  | HashBytes | Hash codes      | Entry bytes |
//! | 8B     | 12B  | 4B        | HashBytes bytes | rest        |
//! +--------+------+-----------+-----------------+-------------+
//! ```
//!
//! All integers are big-endian. The hash block is length-prefixed so entries
//! written under different field counts stay parseable.

use super::MangledEntry;
use std::fmt;
use std::sync::OnceLock;
use tuplespace_common::{Error, Oid, Result, TypeName};

const HEADER_SIZE: usize = 8 + Oid::SIZE + 4;

/// One stored tuple.
///
/// Either side of the codec may be missing: an entry built from a write
/// serializes lazily, an entry read from disk deserializes lazily. Both are
/// cached once computed.
#[derive(Clone)]
pub struct PersistentEntry {
    oid: Oid,
    expiry: u64,
    hash_codes: OnceLock<Vec<u32>>,
    bytes: OnceLock<Vec<u8>>,
    entry: OnceLock<MangledEntry>,
}

impl PersistentEntry {
    /// Wrap a freshly written entry
    pub fn new(oid: Oid, entry: MangledEntry, expiry: u64) -> Self {
        Self {
            oid,
            expiry,
            hash_codes: OnceLock::new(),
            bytes: OnceLock::new(),
            entry: OnceLock::from(entry),
        }
    }

    /// Parse the flattened layout
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::codec(format!(
                "persistent entry too small: {} bytes",
                data.len()
            )));
        }

        let expiry = u64::from_be_bytes(read_array(data, 0)?);
        let oid = Oid::from_bytes(&data[8..8 + Oid::SIZE])
            .ok_or_else(|| Error::codec("bad OID in persistent entry"))?;
        let hash_len = u32::from_be_bytes(read_array(data, 8 + Oid::SIZE)?) as usize;

        if hash_len % 4 != 0 {
            return Err(Error::codec(format!("hash block of {hash_len} bytes")));
        }
        let payload_start = HEADER_SIZE + hash_len;
        if data.len() < payload_start {
            return Err(Error::codec("persistent entry truncated in hash block"));
        }

        let hash_codes: Vec<u32> = data[HEADER_SIZE..payload_start]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            oid,
            expiry,
            hash_codes: OnceLock::from(hash_codes),
            bytes: OnceLock::from(data[payload_start..].to_vec()),
            entry: OnceLock::new(),
        })
    }

    /// Canonical byte layout
    pub fn flatten(&self) -> Result<Vec<u8>> {
        let hashes = self.hash_codes();
        let payload = self.entry_bytes()?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + hashes.len() * 4 + payload.len());
        buf.extend_from_slice(&self.expiry.to_be_bytes());
        buf.extend_from_slice(&self.oid.to_bytes());
        buf.extend_from_slice(&((hashes.len() * 4) as u32).to_be_bytes());
        for h in hashes {
            buf.extend_from_slice(&h.to_be_bytes());
        }
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn set_expiry(&mut self, expiry: u64) {
        self.expiry = expiry;
    }

    /// Lease lapsed strictly before `now`
    #[must_use]
    pub fn has_expired(&self, now: u64) -> bool {
        self.expiry < now
    }

    /// Deserialized entry, decoded on first use
    pub fn entry(&self) -> Result<&MangledEntry> {
        if let Some(entry) = self.entry.get() {
            return Ok(entry);
        }
        let bytes = self
            .bytes
            .get()
            .ok_or_else(|| Error::internal("persistent entry has neither form"))?;
        let decoded = MangledEntry::from_bytes(bytes)?;
        Ok(self.entry.get_or_init(|| decoded))
    }

    /// Opaque payload, encoded on first use
    pub fn entry_bytes(&self) -> Result<&[u8]> {
        if let Some(bytes) = self.bytes.get() {
            return Ok(bytes);
        }
        let encoded = self.entry()?.to_bytes()?;
        Ok(self.bytes.get_or_init(|| encoded))
    }

    /// Type of the stored entry
    pub fn type_name(&self) -> Result<&TypeName> {
        Ok(self.entry()?.type_name())
    }

    /// Per-field hash codes, zero for null fields
    pub fn hash_codes(&self) -> &[u32] {
        self.hash_codes.get_or_init(|| {
            self.entry
                .get()
                .map(MangledEntry::hash_codes)
                .unwrap_or_default()
        })
    }

    /// Hash code of field `i`
    #[must_use]
    pub fn hash_code_for_field(&self, i: usize) -> Option<u32> {
        self.hash_codes().get(i).copied()
    }

    /// Independent copy (lazily computed forms included)
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> Result<[u8; N]> {
    data.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::codec("persistent entry header truncated"))
}

impl fmt::Debug for PersistentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentEntry")
            .field("oid", &self.oid)
            .field("expiry", &self.expiry)
            .field("fields", &self.hash_codes().len())
            .finish_non_exhaustive()
    }
}
